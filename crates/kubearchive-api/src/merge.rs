//! Merging live and archived results into one paged listing.
//!
//! Pages are served from the live cluster first. Once live is exhausted the
//! composite token carries the live-exhausted marker plus the archive
//! cursor, and all further pages come from the archive alone. The page on
//! which the handover happens is filled from the archive, deduplicated by
//! uid with the live copy winning.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use kubearchive_storage::{Database, Page, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{
    error::{ApiError, Result},
    live::{LivePage, LiveResult},
};

/// The composite continue token of the merged listing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    /// Fingerprint of the filter set this token belongs to.
    #[serde(default)]
    pub fingerprint: String,
    /// The apiserver's continuation, while live results remain.
    #[serde(default)]
    pub live: Option<String>,
    /// Set once the live side is exhausted.
    #[serde(default)]
    pub live_done: bool,
    /// The archive adapter's continuation.
    #[serde(default)]
    pub archive: Option<String>,
}

impl PageToken {
    pub fn decode(raw: Option<&str>, filter: &QueryFilter) -> Result<Self> {
        let Some(raw) = raw else {
            return Ok(Self {
                fingerprint: filter.fingerprint(),
                ..Self::default()
            });
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| ApiError::bad_request("malformed continue token"))?;
        let token: Self = serde_json::from_slice(&bytes)
            .map_err(|_| ApiError::bad_request("malformed continue token"))?;

        if token.fingerprint != filter.fingerprint() {
            return Err(ApiError::bad_request(
                "continue token was issued for a different query",
            ));
        }

        Ok(token)
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }
}

/// The assembled response page.
#[derive(Clone, Debug, Default)]
pub struct MergedPage {
    pub items: Vec<Json>,
    pub continue_token: Option<String>,
    /// True when the live side answered "kind not served" — combined with an
    /// empty archive this becomes the 404.
    pub live_not_served: bool,
}

/// Combines the (concurrently fetched) live and archive results for one
/// request. Pure so the paging rules are testable without a cluster.
pub fn assemble(
    token: &PageToken,
    filter: &QueryFilter,
    limit: u32,
    live: Option<LiveResult>,
    archive: Page,
) -> MergedPage {
    let fingerprint = token.fingerprint.clone();

    let (live_page, live_not_served) = match live {
        Some(LiveResult::Page(page)) => (Some(page), false),
        Some(LiveResult::NotServed) => (Some(LivePage::default()), true),
        // live phase already finished on an earlier page
        None => (None, false),
    };

    let Some(live_page) = live_page else {
        // pure archive phase
        let continue_token = archive.continue_token(filter).map(|archive_token| {
            PageToken {
                fingerprint,
                live: None,
                live_done: true,
                archive: Some(archive_token),
            }
            .encode()
        });

        return MergedPage {
            items: archive.hits.into_iter().map(|hit| hit.data).collect(),
            continue_token,
            live_not_served,
        };
    };

    let mut items = live_page.items;

    // live still has more pages: serve live only, keep the archive cursor
    // where it is
    if let Some(live_continue) = live_page.continue_token {
        let next = PageToken {
            fingerprint,
            live: Some(live_continue),
            live_done: false,
            archive: token.archive.clone(),
        };
        return MergedPage {
            items,
            continue_token: Some(next.encode()),
            live_not_served,
        };
    }

    // live exhausted on this page: fill the remainder from the archive,
    // dropping rows whose uid the live side already delivered
    let live_uids: Vec<&str> = items
        .iter()
        .filter_map(|item| item.get("metadata")?.get("uid")?.as_str())
        .collect();
    let live_uids: std::collections::HashSet<String> =
        live_uids.into_iter().map(str::to_owned).collect();

    let remaining = (limit as usize).saturating_sub(items.len());
    let mut consumed = 0;
    let mut appended = 0;
    let mut cursor = token.archive.clone();

    for hit in &archive.hits {
        if appended == remaining {
            break;
        }
        consumed += 1;
        cursor = Some(Database::continue_token_for(filter, hit));

        if live_uids.contains(&hit.uid.to_string()) {
            continue;
        }
        items.push(hit.data.clone());
        appended += 1;
    }

    let archive_has_more = archive.more || consumed < archive.hits.len();
    let continue_token = archive_has_more.then(|| {
        PageToken {
            fingerprint,
            live: None,
            live_done: true,
            archive: cursor,
        }
        .encode()
    });

    MergedPage {
        items,
        continue_token,
        live_not_served,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use kubearchive_storage::Hit;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn filter() -> QueryFilter {
        QueryFilter {
            namespace: Some("default".to_owned()),
            api_version: "v1".to_owned(),
            kind: "Pod".to_owned(),
            ..QueryFilter::default()
        }
    }

    fn hit(uid: Uuid, name: &str) -> Hit {
        Hit {
            uid,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            data: json!({"metadata": {"uid": uid.to_string(), "name": name}}),
        }
    }

    fn live_item(uid: Uuid, name: &str) -> Json {
        json!({"metadata": {"uid": uid.to_string(), "name": name}})
    }

    fn start_token() -> PageToken {
        PageToken {
            fingerprint: filter().fingerprint(),
            ..PageToken::default()
        }
    }

    #[test]
    fn token_round_trips_and_binds_to_the_filter() {
        let token = PageToken {
            fingerprint: filter().fingerprint(),
            live: Some("l".to_owned()),
            live_done: false,
            archive: None,
        };

        let decoded = PageToken::decode(Some(&token.encode()), &filter()).unwrap();
        assert_eq!(decoded, token);

        let mut other = filter();
        other.kind = "Job".to_owned();
        assert!(PageToken::decode(Some(&token.encode()), &other).is_err());
    }

    #[test]
    fn live_pages_are_served_first() {
        let uid = Uuid::new_v4();
        let live = LivePage {
            items: vec![live_item(uid, "live-1")],
            continue_token: Some("live-cursor".to_owned()),
        };
        let archive = Page {
            hits: vec![hit(Uuid::new_v4(), "archived-1")],
            more: false,
        };

        let page = assemble(
            &start_token(),
            &filter(),
            10,
            Some(LiveResult::Page(live)),
            archive,
        );

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["metadata"]["name"], "live-1");

        let next = PageToken::decode(page.continue_token.as_deref(), &filter()).unwrap();
        assert_eq!(next.live.as_deref(), Some("live-cursor"));
        assert!(!next.live_done);
    }

    #[test]
    fn handover_page_fills_from_archive_and_dedups_by_uid() {
        let shared = Uuid::new_v4();
        let archived_only = Uuid::new_v4();

        let live = LivePage {
            items: vec![live_item(shared, "shared-live-copy")],
            continue_token: None,
        };
        let archive = Page {
            hits: vec![hit(shared, "shared-archive-copy"), hit(archived_only, "old")],
            more: false,
        };

        let page = assemble(
            &start_token(),
            &filter(),
            10,
            Some(LiveResult::Page(live)),
            archive,
        );

        // the live copy wins for the shared uid; the archive-only row follows
        let names: Vec<&str> = page
            .items
            .iter()
            .map(|item| item["metadata"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["shared-live-copy", "old"]);
        assert!(page.continue_token.is_none());
    }

    #[test]
    fn archive_phase_serves_archive_only() {
        let token = PageToken {
            fingerprint: filter().fingerprint(),
            live: None,
            live_done: true,
            archive: None,
        };
        let archive = Page {
            hits: vec![hit(Uuid::new_v4(), "a"), hit(Uuid::new_v4(), "b")],
            more: true,
        };

        let page = assemble(&token, &filter(), 2, None, archive);

        assert_eq!(page.items.len(), 2);
        let next = PageToken::decode(page.continue_token.as_deref(), &filter()).unwrap();
        assert!(next.live_done);
        assert!(next.archive.is_some());
    }

    #[test]
    fn partial_archive_consumption_advances_the_cursor_mid_page() {
        let live = LivePage {
            items: vec![live_item(Uuid::new_v4(), "live-1")],
            continue_token: None,
        };
        // limit 2: one slot remains, only the first archive hit is consumed
        let archive = Page {
            hits: vec![hit(Uuid::new_v4(), "a"), hit(Uuid::new_v4(), "b")],
            more: false,
        };

        let page = assemble(
            &start_token(),
            &filter(),
            2,
            Some(LiveResult::Page(live)),
            archive,
        );

        assert_eq!(page.items.len(), 2);
        let next = PageToken::decode(page.continue_token.as_deref(), &filter()).unwrap();
        assert!(next.live_done);
        // the cursor points at "a", so "b" comes on the next page
        assert!(next.archive.is_some());
    }

    #[test]
    fn not_served_live_side_is_empty_but_flagged() {
        let archive = Page::default();
        let page = assemble(
            &start_token(),
            &filter(),
            10,
            Some(LiveResult::NotServed),
            archive,
        );

        assert!(page.items.is_empty());
        assert!(page.live_not_served);
        assert!(page.continue_token.is_none());
    }
}
