pub mod parser;
pub mod transport;

pub use parser::{parse_events, ByteStream, EventStream, FrameDelimiter, FrameParser, ParserConfig};
pub use transport::{HttpStreamTransport, StreamRequest, StreamTransport};
