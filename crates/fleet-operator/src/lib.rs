//! Fleet operator library: controller wiring and startup helpers

pub mod controller_runner;
pub mod crds;
pub mod settings;
