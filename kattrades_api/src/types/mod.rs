mod envelope;
pub use self::envelope::{Body, Envelope, Header, Items, OneOrMany, RawItem, ResponseBody};
