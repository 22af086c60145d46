pub mod db;
pub mod lm;

pub use db::DbAdapter;
pub use lm::LmStudioAdapter;
