//! Follows badge references until nothing new turns up.
//!
//! Awards name definitions, definitions belong to issuers, issuers have
//! profiles and contact lists. Every connection polls for the keys in the
//! interest registries, and stops once a full round passes without the
//! registries changing. Keys that never resolve do not keep the loop alive.

use std::time::Duration;

use tracing::debug;

use crate::{
    event::kinds,
    filter::Filter,
    session::Shared,
    store::Interest,
};

const RESOLVE_LIMIT: u32 = 1000;

/// How a resolution loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The interest set stopped changing.
    Converged { iterations: usize },
    /// The session was reset underneath the loop.
    Cancelled,
    /// The relay went away mid-loop.
    Interrupted,
}

/// One combined query covering everything in `interest`.
pub fn resolution_filters(interest: &Interest) -> Vec<Filter> {
    let mut filters = Vec::new();
    if !interest.definitions.is_empty() {
        let issuers: Vec<&str> = interest
            .definitions
            .iter()
            .map(|k| k.issuer.as_str())
            .collect();
        let mut ds: Vec<&str> = interest.definitions.iter().map(|k| k.d.as_str()).collect();
        ds.sort_unstable();
        ds.dedup();
        filters.push(
            Filter::new()
                .kinds([kinds::BADGE_DEFINITION])
                .authors(dedup(issuers))
                .tag("d", ds)
                .limit(RESOLVE_LIMIT),
        );
    }
    if !interest.issuers.is_empty() {
        for kind in [kinds::PROFILE, kinds::CONTACTS, kinds::RELAY_LIST] {
            filters.push(
                Filter::new()
                    .kinds([kind])
                    .authors(interest.issuers.iter().cloned())
                    .limit(RESOLVE_LIMIT),
            );
        }
    }
    filters
}

fn dedup(mut v: Vec<&str>) -> Vec<&str> {
    v.sort_unstable();
    v.dedup();
    v
}

/// Poll `url` for the current interest set until it converges.
pub(crate) async fn resolve(shared: &Shared, url: &str, backoff: Duration) -> Resolution {
    let mut previous: Option<Interest> = None;
    let mut iterations = 0;
    loop {
        if !shared.is_current() {
            return Resolution::Cancelled;
        }
        let interest = shared.interest();
        if previous.as_ref() == Some(&interest) {
            debug!(relay = %url, iterations, "resolution converged");
            return Resolution::Converged { iterations };
        }
        iterations += 1;
        if !interest.is_empty() {
            match shared.pool.query(url, &resolution_filters(&interest)).await {
                Ok(events) => {
                    if !shared.merge(events, url) {
                        return Resolution::Cancelled;
                    }
                }
                Err(e) => {
                    debug!(relay = %url, error = %e, "resolution query failed");
                    return Resolution::Interrupted;
                }
            }
        }
        previous = Some(interest);
        tokio::time::sleep(backoff).await;
    }
}
