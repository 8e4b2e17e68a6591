pub mod captions;
pub mod constraints;
pub mod embed;
pub mod events;
pub mod gallery;
pub mod state;
