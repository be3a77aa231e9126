use chrono::NaiveDate;

use crate::fod::{
    connection::{ApiGroup, Connection},
    query::{QueryBuilder, typed_query_builder},
};

const DATE_FORMAT: &str = "%Y-%m-%d";

typed_query_builder!(
    /// Query over `/scans` or `/releases/{releaseId}/scans`.
    ScansQueryBuilder
);

impl ScansQueryBuilder {
    pub fn completed_on_start_date(self, date: NaiveDate) -> Self {
        self.param("completedOnStartDate", date.format(DATE_FORMAT))
    }

    pub fn completed_on_end_date(self, date: NaiveDate) -> Self {
        self.param("completedOnEndDate", date.format(DATE_FORMAT))
    }

    pub fn started_on_start_date(self, date: NaiveDate) -> Self {
        self.param("startedOnStartDate", date.format(DATE_FORMAT))
    }

    pub fn scan_type(self, scan_type: &str) -> Self {
        self.filter("scanType", scan_type)
    }
}

#[derive(Clone)]
pub struct ScanApi {
    conn: Connection,
}

impl ApiGroup for ScanApi {
    fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl ScanApi {
    pub fn query_scans(&self) -> ScansQueryBuilder {
        QueryBuilder::new(self.conn.clone(), "scans").into()
    }

    pub fn query_release_scans(&self, release_id: &str) -> ScansQueryBuilder {
        QueryBuilder::new(self.conn.clone(), format!("releases/{release_id}/scans")).into()
    }
}
