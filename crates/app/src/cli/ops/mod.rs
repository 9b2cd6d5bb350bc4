pub mod del;
pub mod get;
pub mod ls;
pub mod put;
pub mod tree;
pub mod version;
pub mod watch;

pub use del::Del;
pub use get::Get;
pub use ls::Ls;
pub use put::Put;
pub use tree::Tree;
pub use version::Version;
pub use watch::Watch;
