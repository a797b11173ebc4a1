pub mod settings;
pub mod torgon;
