pub mod backend;
pub mod load_model;
pub mod sampler;
