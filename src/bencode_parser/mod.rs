pub mod encoder;
pub mod errors;
pub mod parser;

pub use encoder::encode;
pub use errors::DecodeError;
pub use parser::{Value, parse, parse_one, raw_dict_value};
