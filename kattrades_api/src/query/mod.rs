mod common;
pub use self::common::{Query, QueryCommon};

mod trade;
pub use self::trade::TradeQuery;
