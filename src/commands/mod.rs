pub mod quota;
pub mod utils;

pub use utils::init_logging;
