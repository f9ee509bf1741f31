pub mod db;
pub mod files;
pub mod models;

pub use db::{DbHandle, SpecflowDb, slugify};
pub use files::ArtifactFiles;
pub use models::*;
