//! Shared query infrastructure: the [`Query`] trait and [`QueryCommon`] paging fields.

use url::Url;

/// Trait implemented by query builders. Provides URL serialization and
/// shared builder methods for pagination.
pub trait Query {
    /// Appends this query's parameters to the given URL, returning the modified URL.
    fn add_to_url(&self, url: &Url) -> Url;

    /// Returns a mutable reference to the common query fields.
    fn get_common(&mut self) -> &mut QueryCommon;

    /// Sets the page number (1-indexed).
    fn with_page(mut self, page: u32) -> Self
    where
        Self: Sized,
    {
        self.get_common().page_no = page;
        self
    }

    /// Sets the number of rows per page.
    fn with_page_size(mut self, page_size: u32) -> Self
    where
        Self: Sized,
    {
        self.get_common().num_of_rows = page_size;
        self
    }
}

/// Paging fields sent with every request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryCommon {
    /// Page number (1-indexed). Defaults to 1.
    pub page_no: u32,
    /// Rows per page. Defaults to 50.
    pub num_of_rows: u32,
}

impl Default for QueryCommon {
    fn default() -> QueryCommon {
        QueryCommon {
            page_no: 1,
            num_of_rows: 50,
        }
    }
}

impl QueryCommon {
    /// Appends the paging parameters and the JSON return type to the URL.
    pub fn add_to_url(&self, url: &Url) -> Url {
        let mut url = url.clone();
        url.query_pairs_mut()
            .append_pair("pageNo", &self.page_no.to_string())
            .append_pair("numOfRows", &self.num_of_rows.to_string())
            .append_pair("returnType", "json");
        url
    }
}
