pub mod layers;
pub mod paths;
pub mod persistence;
pub mod schema;

pub use layers::*;
pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_allow_other() -> bool {
    false
}

fn default_auto_unmount() -> bool {
    true
}
