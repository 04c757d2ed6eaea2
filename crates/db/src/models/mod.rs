pub mod model_parameter;
pub mod setting;
