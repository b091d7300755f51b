pub mod attributes;
pub mod classifier;
pub mod correlation;
pub mod errors;
pub mod extractor;
pub mod models;
pub mod reference;
pub mod settings;
pub mod similarity;
pub mod store;
