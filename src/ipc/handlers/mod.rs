pub mod catalog;
pub mod content;
pub mod core;
pub mod grades;
pub mod progress;
