use chrono::NaiveDate;
use url::Url;

use super::common::{Query, QueryCommon};

/// Query for the settled-auction trades endpoint.
///
/// Every filter is sent as an equality condition, `cond[<field>::EQ]=<value>`.
/// Unset filters are omitted, so a query with only a date and commodity
/// classes is an unscoped (global) query across every market.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TradeQuery {
    pub common: QueryCommon,
    pub market_code: Option<String>,
    pub corp_code: Option<String>,
    pub large_class: Option<String>,
    pub mid_class: Option<String>,
    pub settlement_date: Option<NaiveDate>,
}

impl Query for TradeQuery {
    fn get_common(&mut self) -> &mut QueryCommon {
        &mut self.common
    }

    fn add_to_url(&self, url: &Url) -> Url {
        let mut url = self.common.add_to_url(url);
        let conditions = [
            ("whsl_mrkt_cd", self.market_code.clone()),
            ("corp_cd", self.corp_code.clone()),
            ("gds_lclsf_cd", self.large_class.clone()),
            ("gds_mclsf_cd", self.mid_class.clone()),
            (
                "trd_clcln_ymd",
                self.settlement_date.map(|d| d.format("%Y-%m-%d").to_string()),
            ),
        ];
        for (field, value) in conditions {
            if let Some(value) = value {
                url.query_pairs_mut()
                    .append_pair(&format!("cond[{}::EQ]", field), &value);
            }
        }
        url
    }
}

impl TradeQuery {
    /// Restricts the query to one wholesale market.
    pub fn with_market(mut self, market_code: &str) -> Self {
        self.market_code = Some(market_code.to_string());
        self
    }

    /// Restricts the query to one auction corporation.
    pub fn with_corp(mut self, corp_code: &str) -> Self {
        self.corp_code = Some(corp_code.to_string());
        self
    }

    /// Filters by large commodity classification code (e.g. `08`).
    pub fn with_large_class(mut self, code: &str) -> Self {
        self.large_class = Some(code.to_string());
        self
    }

    /// Filters by mid commodity classification code (e.g. `03`).
    pub fn with_mid_class(mut self, code: &str) -> Self {
        self.mid_class = Some(code.to_string());
        self
    }

    /// Filters by settlement date.
    pub fn with_settlement_date(mut self, date: NaiveDate) -> Self {
        self.settlement_date = Some(date);
        self
    }
}
