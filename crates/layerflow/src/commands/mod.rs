pub mod build;
pub mod gc;
pub mod images;
pub mod stages;
pub mod validate;
