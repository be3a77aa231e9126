use std::ops::ControlFlow;

use crate::{
    error::Result,
    fod::{Connection, VulnerabilityApi},
    header, info, success,
};

use super::target_release_id;

pub async fn vulnerabilities(conn: &Connection, max_results: usize) -> Result<()> {
    let release_id = target_release_id(conn)?;

    header!("Query vulnerabilities of release {release_id}");
    let summary = conn
        .api::<VulnerabilityApi>()
        .query_vulnerabilities_on_demand_all(&release_id)
        .max_results(max_results)
        .build()
        .process_all(|vuln| {
            info!("Vulnerability data");
            println!("{vuln}");
            for detail in ["summary", "traces"] {
                info!("Vulnerability {detail}");
                match vuln.value(detail) {
                    Some(value) => println!("{value:#}"),
                    None => println!("<none>"),
                }
            }
            ControlFlow::Continue(())
        })
        .await?;

    success!(
        "Processed {} vulnerabilities from {} pages",
        summary.items,
        summary.pages
    );
    Ok(())
}
