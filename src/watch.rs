use serde_json::value::RawValue;
use tokio::time::{sleep, Instant};

use crate::keys::Key;
use crate::models::{
    cut_json_fields, hit_nodes_with_event_type, ApiError, ChainNode, WatchEventOptions,
    WatchEventResp, EVENT_STEP, LOOP_INTERVAL, NO_EVENT_CURSOR, PROJECT_ID, TIMEOUT_WATCH_LOOP,
};
use crate::redis_db::{ChainStore, StoreError};

/// Long-poll the chain strictly after the client's cursor. Returns matched
/// events as soon as a round hits; otherwise holds the request until the
/// deadline and hands back a resumable cursor (or `NoEventCursor` when the
/// chain had nothing at all).
pub(crate) async fn watch_with_cursor<S: ChainStore>(
    store: &S,
    key: &Key,
    opts: &WatchEventOptions,
    rid: &str,
) -> Result<Vec<WatchEventResp>, ApiError> {
    let start_cursor = if opts.cursor == NO_EVENT_CURSOR {
        // the previous round saw no events at all; resume from the head so
        // nothing appended since then is missed
        key.head_key().to_string()
    } else {
        opts.cursor.clone()
    };

    let start = Instant::now();
    loop {
        // each round re-scans from the original cursor so appends that land
        // mid-poll become visible
        let nodes = store
            .get_nodes_from_cursor(EVENT_STEP, &start_cursor, key)
            .await
            .map_err(|e| store_error(e, "watch with cursor: fetch window failed", rid))?;

        if nodes.is_empty() {
            if start.elapsed() > TIMEOUT_WATCH_LOOP {
                tracing::debug!(
                    target: PROJECT_ID,
                    rid,
                    cursor = %opts.cursor,
                    "no event found in the chain before the deadline"
                );
                return Ok(vec![WatchEventResp::miss(key.resource())]);
            }
            sleep(LOOP_INTERVAL).await;
            continue;
        }

        let hit = hit_nodes_with_event_type(&nodes, &opts.event_types);
        if !hit.is_empty() {
            tracing::debug!(
                target: PROJECT_ID,
                rid,
                namespace = %key.namespace(),
                hits = hit.len(),
                "events hit, returning immediately"
            );
            return events_with_cursor_nodes(store, key, opts, &hit, rid).await;
        }

        if start.elapsed() > TIMEOUT_WATCH_LOOP {
            // nothing matched before the deadline; return the last observed
            // cursor with a null detail so the next call resumes after it
            if let Some(last) = nodes.last() {
                return Ok(vec![WatchEventResp {
                    cursor: last.cursor.clone(),
                    resource: key.resource(),
                    detail: None,
                }]);
            }
        }
        sleep(LOOP_INTERVAL).await;
    }
}

/// Serve a wall-clock starting timestamp: gate it against the chain's
/// retained range, then scan from the head for the first events at or after
/// the requested second.
pub(crate) async fn watch_with_start_from<S: ChainStore>(
    store: &S,
    key: &Key,
    opts: &WatchEventOptions,
    rid: &str,
) -> Result<Vec<WatchEventResp>, ApiError> {
    let (head_target, tail_target) = store
        .get_head_tail_target_nodes(key)
        .await
        .map_err(|e| store_error(e, "watch with start from: fetch chain targets failed", rid))?;

    // chain with no real events: the targets are the sentinels themselves.
    // A lone real node's next pointer also equals the tail cursor, so test
    // sentinel identity rather than the next pointer.
    if head_target.cursor == key.head_key() || tail_target.cursor == key.tail_key() {
        let diff = now_unix() - opts.start_from;
        if diff < 0 || diff > key.ttl_seconds() {
            return Err(ApiError::StartFromOutOfRange);
        }
        // in range but nothing retained yet; the scan reports the miss
        return scan_from_head(store, key, opts, rid).await;
    }

    // requested time precedes retained history
    if head_target.cluster_time.sec > opts.start_from {
        return Err(ApiError::StartFromTooSmall);
    }

    // requested time is ahead of the live edge, degrade to from-now
    if tail_target.cluster_time.sec < opts.start_from {
        let latest = watch_from_now(store, key, opts, rid).await?;
        return Ok(vec![latest]);
    }

    scan_from_head(store, key, opts, rid).await
}

async fn scan_from_head<S: ChainStore>(
    store: &S,
    key: &Key,
    opts: &WatchEventOptions,
    rid: &str,
) -> Result<Vec<WatchEventResp>, ApiError> {
    let mut next_cursor = key.head_key().to_string();
    let start = Instant::now();
    loop {
        if start.elapsed() > TIMEOUT_WATCH_LOOP {
            tracing::error!(
                target: PROJECT_ID,
                rid,
                start_from = opts.start_from,
                namespace = %key.namespace(),
                "scanning the cursor chain exceeded the time budget"
            );
            return Err(ApiError::BackendError);
        }

        let nodes = store
            .get_nodes_from_cursor(EVENT_STEP, &next_cursor, key)
            .await
            .map_err(|e| store_error(e, "watch with start from: fetch window failed", rid))?;

        if nodes.is_empty() {
            // the tail sentinel should always be reachable; report a miss but
            // flag the chain state
            tracing::warn!(
                target: PROJECT_ID,
                rid,
                namespace = %key.namespace(),
                "no nodes found scanning the chain, sentinel state may be inconsistent"
            );
            return Ok(vec![WatchEventResp::miss(key.resource())]);
        }

        let hit = hit_nodes_with_event_type(&nodes, &opts.event_types);
        let matched: Vec<ChainNode> = hit
            .into_iter()
            .filter(|node| node.cluster_time.sec >= opts.start_from)
            .collect();
        if !matched.is_empty() {
            return events_with_cursor_nodes(store, key, opts, &matched, rid).await;
        }

        let Some(last) = nodes.last() else {
            return Ok(vec![WatchEventResp::miss(key.resource())]);
        };

        if last.next_cursor == key.tail_key() {
            // scanned to the end without a match; return the last cursor so
            // the client resumes here instead of re-scanning from the head
            let detail = store
                .get_detail(&key.detail_key(&last.cursor))
                .await
                .map_err(|e| store_error(e, "watch with start from: fetch last detail failed", rid))?;
            return Ok(vec![WatchEventResp {
                cursor: last.cursor.clone(),
                resource: key.resource(),
                detail: Some(raw_detail(detail, rid)?),
            }]);
        }

        next_cursor = last.cursor.clone();
    }
}

/// Serve "from now": the newest retained event if it matches the requested
/// types, a miss otherwise. The handler wraps the single response in a list.
pub(crate) async fn watch_from_now<S: ChainStore>(
    store: &S,
    key: &Key,
    opts: &WatchEventOptions,
    rid: &str,
) -> Result<WatchEventResp, ApiError> {
    let latest = store
        .get_latest_event_detail(key)
        .await
        .map_err(|e| store_error(e, "watch from now: fetch latest event failed", rid))?;

    let Some((node, detail)) = latest else {
        return Ok(WatchEventResp::miss(key.resource()));
    };

    let hit = hit_nodes_with_event_type(std::slice::from_ref(&node), &opts.event_types);
    if hit.is_empty() {
        return Ok(WatchEventResp::miss(key.resource()));
    }

    let cut = cut_json_fields(detail, &opts.fields);
    Ok(WatchEventResp {
        cursor: node.cursor,
        resource: key.resource(),
        detail: Some(raw_detail(cut, rid)?),
    })
}

/// Fetch the details of the hit nodes in one pipelined round trip and
/// assemble the response list in chain order.
async fn events_with_cursor_nodes<S: ChainStore>(
    store: &S,
    key: &Key,
    opts: &WatchEventOptions,
    hit: &[ChainNode],
    rid: &str,
) -> Result<Vec<WatchEventResp>, ApiError> {
    let detail_keys: Vec<String> = hit.iter().map(|n| key.detail_key(&n.cursor)).collect();
    let details = store
        .get_details(&detail_keys)
        .await
        .map_err(|e| store_error(e, "pipelined event detail fetch failed", rid))?;

    let mut resp = Vec::with_capacity(hit.len());
    for (node, detail) in hit.iter().zip(details) {
        let cut = cut_json_fields(detail, &opts.fields);
        resp.push(WatchEventResp {
            cursor: node.cursor.clone(),
            resource: key.resource(),
            detail: Some(raw_detail(cut, rid)?),
        });
    }
    Ok(resp)
}

fn raw_detail(detail: String, rid: &str) -> Result<Box<RawValue>, ApiError> {
    RawValue::from_string(detail).map_err(|error| {
        tracing::error!(target: PROJECT_ID, rid, %error, "stored event detail is not valid JSON");
        ApiError::BackendError
    })
}

fn store_error(error: StoreError, what: &str, rid: &str) -> ApiError {
    match error {
        StoreError::CursorNotFound(cursor) => {
            tracing::warn!(target: PROJECT_ID, rid, %cursor, "{what}: cursor is not resolvable");
            ApiError::InputInvalid("cursor is unknown or has expired".to_string())
        }
        StoreError::Backend(error) => {
            tracing::error!(target: PROJECT_ID, rid, %error, "{what}");
            ApiError::BackendError
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
