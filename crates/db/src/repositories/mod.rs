//! Repository layer: one zero-sized struct per table with async
//! functions taking a `&SqlitePool`.

pub mod model_parameter_repo;
pub mod setting_repo;

pub use model_parameter_repo::ModelParameterRepo;
pub use setting_repo::SettingRepo;
