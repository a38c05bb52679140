pub mod body;
pub mod change;
pub mod credentials;
pub mod error;
pub mod forge;
pub mod hook;
pub mod message;
pub mod rebase;
pub mod repo;
pub mod review;

pub use change::{Change, BRANCH_PREFIX};
pub use error::ReviewError;
pub use message::Message;
pub use repo::{Commit, GitRepository, Reference, Repository};
pub use review::{review, Environment, ReviewOptions};
