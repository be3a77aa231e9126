use std::time::Instant;

use tabled::Table;

use crate::{
    error::Result,
    fod::{Connection, ReleaseApi},
    header, info,
    json::JsonList,
    success,
    types::ReleaseTableRow,
};

use super::target_release_id;

pub async fn releases(conn: &Connection, target: &str, rounds: usize) -> Result<()> {
    let api = conn.api::<ReleaseApi>();
    let release_id = target_release_id(conn)?;

    header!("Query all releases, max 3 results");
    let results = api
        .query_releases()
        .max_results(3)
        .fields(["releaseId", "applicationName", "releaseName", "rating"])
        .build()
        .get_all()
        .await?;
    println!("{}", Table::new(table_rows(&results)));
    info!("count: {}", results.len());

    header!("Repeated release queries to demonstrate caching");
    let (application, release) = target.split_once(':').unwrap_or((target, ""));
    for round in 1..=rounds {
        let started = Instant::now();

        let by_application = api
            .query_releases()
            .application_name(application)
            .fields(["releaseId", "releaseName"])
            .use_cache(true)
            .build()
            .get_all()
            .await?;
        let by_id = api
            .query_releases()
            .release_id(&release_id)
            .use_cache(true)
            .build()
            .get_all()
            .await?;
        let unique = if release.is_empty() {
            None
        } else {
            Some(
                api.query_releases()
                    .application_name(application)
                    .release_name(release)
                    .use_cache(true)
                    .build()
                    .get_unique()
                    .await?,
            )
        };
        let resolved = api.get_release_by_name_or_id(target, true).await?;
        let all = api.query_releases().use_cache(true).build().get_all().await?;

        info!(
            "round {round}: {apps} for application, {ids} by id, unique {unique}, resolved {resolved}, {all} in total ({ms} ms)",
            apps = by_application.len(),
            ids = by_id.len(),
            unique = unique.is_some(),
            resolved = resolved.is_some(),
            all = all.len(),
            ms = started.elapsed().as_millis()
        );
    }

    success!(
        "{} cached result sets after {rounds} rounds",
        conn.cache().len()
    );
    Ok(())
}

fn table_rows(releases: &JsonList) -> Vec<ReleaseTableRow> {
    releases
        .iter()
        .map(|r| ReleaseTableRow {
            id: r.get_string_lossy("releaseId").unwrap_or_default(),
            application: r.get_string_lossy("applicationName").unwrap_or_default(),
            release: r.get_string_lossy("releaseName").unwrap_or_default(),
            rating: r.get_string_lossy("rating").unwrap_or_default(),
        })
        .collect()
}
