use crate::fod::{
    connection::{ApiGroup, Connection},
    query::{QueryBuilder, typed_query_builder},
};

typed_query_builder!(
    /// Query over `/releases/{releaseId}/vulnerabilities`.
    VulnerabilitiesQueryBuilder
);

impl VulnerabilitiesQueryBuilder {
    pub fn severity(self, severity: &str) -> Self {
        self.filter("severityString", severity)
    }

    pub fn category(self, category: &str) -> Self {
        self.filter("category", category)
    }

    pub fn scan_type(self, scan_type: &str) -> Self {
        self.filter("scantype", scan_type)
    }

    pub fn include_fixed(self, include: bool) -> Self {
        self.param("includeFixed", include)
    }

    pub fn include_suppressed(self, include: bool) -> Self {
        self.param("includeSuppressed", include)
    }
}

#[derive(Clone)]
pub struct VulnerabilityApi {
    conn: Connection,
}

impl ApiGroup for VulnerabilityApi {
    fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

/// Sub-resources of a vulnerability that `on_demand_all` loads.
pub const VULNERABILITY_DETAILS: [&str; 4] = ["summary", "details", "recommendations", "traces"];

impl VulnerabilityApi {
    pub fn query_vulnerabilities(&self, release_id: &str) -> VulnerabilitiesQueryBuilder {
        QueryBuilder::new(
            self.conn.clone(),
            format!("releases/{release_id}/vulnerabilities"),
        )
        .into()
    }

    /// Vulnerability query that also loads every detail sub-resource of each
    /// returned vulnerability.
    pub fn query_vulnerabilities_on_demand_all(
        &self,
        release_id: &str,
    ) -> VulnerabilitiesQueryBuilder {
        VULNERABILITY_DETAILS
            .iter()
            .fold(self.query_vulnerabilities(release_id), |query, detail| {
                query.on_demand(
                    *detail,
                    format!("releases/{release_id}/vulnerabilities/{{vulnId}}/{detail}"),
                )
            })
    }
}
