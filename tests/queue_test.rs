mod common;

use bytes::Bytes;
use common::{drain_events, drive, queue_with_chunks, Harness};

use resumable_media_upload::error::{ErrorKind, QueueError, RemoteError};
use resumable_media_upload::events::QueueEvent;
use resumable_media_upload::queue::{Queue, TickOutcome, TickStep};
use resumable_media_upload::record::{FlushMarker, QueueRecord};
use resumable_media_upload::store::KvStore;
use resumable_media_upload::{ActivityStatus, QueueKind, QueueStatus};

async fn persisted(h: &Harness, queue: &Queue) -> Option<QueueRecord> {
    let key = &queue.record().queue_key;
    h.store
        .get(key)
        .await
        .unwrap()
        .map(|raw| QueueRecord::decode(key, &raw).unwrap())
}

#[tokio::test]
async fn test_three_chunks_end_to_end() {
    let h = Harness::new();
    let (deps, mut events) = h.deps_with_events();
    let mut queue = Queue::create("d1", QueueKind::Audio, "uploads/d1", "stitched/d1", deps);
    queue.start().await.unwrap();
    for size in [10usize, 20, 30] {
        queue.handle_chunk(Bytes::from(vec![7u8; size])).await.unwrap();
    }
    queue.mark_stopped().await.unwrap();
    assert!(queue.lease().try_acquire().await.unwrap().is_owned());

    let outcomes = drive(&h, &mut queue, 20).await;
    assert_eq!(outcomes.len(), 5, "outcomes: {:?}", outcomes);
    assert!(matches!(outcomes[0], TickOutcome::Uploaded { .. }));
    assert!(matches!(outcomes[2], TickOutcome::Uploaded { .. }));
    assert_eq!(outcomes[3], TickOutcome::Advanced(QueueStatus::Stitching));
    let TickOutcome::Completed(object) = &outcomes[4] else {
        panic!("expected completion, got {:?}", outcomes[4]);
    };
    assert_eq!(object.kind, QueueKind::Audio);
    assert!(object.url.ends_with(&object.path));

    let record = persisted(&h, &queue).await.unwrap();
    assert_eq!(record.status, QueueStatus::Done);
    assert_eq!(record.total_size, 60);
    assert_eq!(record.uploaded_size, 60);
    assert_eq!(record.chunks_uploaded, 3);
    assert_eq!(record.media_keys.len(), 3);
    assert!(record.record_queue.is_empty());
    assert_eq!(record.extra_info.concat_url.as_deref(), Some(object.path.as_str()));

    // Local chunks are gone and the lease was released
    assert!(h.store.keys_with_prefix("Blob_").is_empty());
    assert!(h.store.get(&record.lock_key).await.unwrap().is_none());

    let stitched = h.remote.object(&object.path).unwrap();
    assert_eq!(stitched.len(), 60);

    let events = drain_events(&mut events);
    assert_eq!(events.last(), Some(&QueueEvent::Complete(object.clone())));
    assert!(events.iter().any(|e| matches!(
        e,
        QueueEvent::Progress(p) if p.uploaded_bytes == 60 && p.total_bytes == 60
    )));
}

#[tokio::test]
async fn test_upload_order_matches_arrival_order() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Video, &[1, 2, 3, 4, 5]).await;
    queue.mark_stopped().await.unwrap();

    drive(&h, &mut queue, 20).await;

    let uploaded: Vec<usize> = h
        .remote
        .paths()
        .iter()
        .filter(|p| p.starts_with("uploads/"))
        .map(|p| h.remote.object(p).unwrap().len())
        .collect();
    assert_eq!(uploaded, vec![1, 2, 3, 4, 5]);
    assert_eq!(queue.record().media_keys, {
        let mut paths = h.remote.paths();
        paths.retain(|p| p.starts_with("uploads/"));
        paths
    });
}

#[tokio::test]
async fn test_uploaded_size_tracks_uploaded_chunks() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[5, 50, 500]).await;
    queue.mark_stopped().await.unwrap();

    let mut previous = 0;
    for _ in 0..10 {
        h.clock.advance(1);
        let outcome = queue.tick().await.unwrap();
        let record = queue.record();
        assert!(record.uploaded_size >= previous);
        let expected: u64 = record.chunk_sizes[..record.chunks_uploaded as usize]
            .iter()
            .sum();
        assert_eq!(record.uploaded_size, expected);
        assert!(record.chunks_uploaded as usize <= record.media_keys.len());
        previous = record.uploaded_size;
        if outcome.is_finished() {
            break;
        }
    }
    assert_eq!(queue.status(), QueueStatus::Done);
    assert_eq!(previous, 555);
}

#[tokio::test]
async fn test_stop_without_chunks_is_no_data() {
    let h = Harness::new();
    let mut queue = h.queue("d1", QueueKind::Screen);
    queue.start().await.unwrap();
    queue.mark_stopped().await.unwrap();

    let outcomes = drive(&h, &mut queue, 5).await;
    assert_eq!(
        outcomes,
        vec![
            TickOutcome::Advanced(QueueStatus::Stitching),
            TickOutcome::Finished(QueueStatus::NoData)
        ]
    );
    assert_eq!(h.remote.concat_calls(), 0);
    assert_eq!(persisted(&h, &queue).await.unwrap().status, QueueStatus::NoData);
}

#[tokio::test]
async fn test_live_queue_uploads_while_recording() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[8]).await;

    assert!(matches!(
        queue.tick().await.unwrap(),
        TickOutcome::Uploaded { .. }
    ));
    // Empty but still live: wait for more chunks
    assert_eq!(queue.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(queue.status(), QueueStatus::Pending);
}

#[tokio::test]
async fn test_missing_chunk_gives_up_after_eleven_failures() {
    let h = Harness::new();
    let (deps, mut events) = h.deps_with_events();
    let mut queue = Queue::create("d1", QueueKind::Audio, "up", "st", deps);
    queue.start().await.unwrap();
    let key = queue.handle_chunk(Bytes::from_static(b"abc")).await.unwrap().unwrap();
    queue.mark_stopped().await.unwrap();
    h.store.delete(&key).await.unwrap();
    assert!(queue.lease().try_acquire().await.unwrap().is_owned());

    for attempt in 1..=10 {
        assert_eq!(
            queue.tick().await.unwrap(),
            TickOutcome::Retry(ErrorKind::MissingChunk),
            "attempt {}",
            attempt
        );
    }
    assert_eq!(
        queue.tick().await.unwrap(),
        TickOutcome::Finished(QueueStatus::Error)
    );

    let record = persisted(&h, &queue).await.unwrap();
    assert_eq!(record.status, QueueStatus::Error);
    assert_eq!(record.error_getting_element, 11);
    assert!(h.store.get(&record.lock_key).await.unwrap().is_none());
    assert!(!queue.lease().is_held());

    let events = drain_events(&mut events);
    assert!(events.contains(&QueueEvent::Error {
        kind: QueueKind::Audio,
        error: ErrorKind::MissingChunkGaveUp,
        fatal: true,
    }));
}

#[tokio::test]
async fn test_stitch_failures_give_up_after_eleven() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[4]).await;
    queue.mark_stopped().await.unwrap();
    h.remote
        .fail_concats(11, RemoteError::remote("invalid part", false));

    let outcomes = drive(&h, &mut queue, 30).await;
    assert_eq!(outcomes.last(), Some(&TickOutcome::Finished(QueueStatus::Error)));
    let retries = outcomes
        .iter()
        .filter(|o| **o == TickOutcome::Retry(ErrorKind::StitchFailed))
        .count();
    assert_eq!(retries, 10);
    assert_eq!(queue.record().error_invoking_concat, 11);
    assert_eq!(h.remote.concat_calls(), 11);
}

#[tokio::test]
async fn test_retryable_stitch_failures_carry_no_penalty() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[4, 4]).await;
    queue.mark_stopped().await.unwrap();
    h.remote.fail_concats(15, RemoteError::remote("throttled", true));

    let outcomes = drive(&h, &mut queue, 40).await;
    assert!(matches!(outcomes.last(), Some(TickOutcome::Completed(_))));
    assert_eq!(queue.record().error_invoking_concat, 0);
    assert_eq!(queue.status(), QueueStatus::Done);
}

#[tokio::test]
async fn test_network_failure_keeps_chunk_at_head() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[9]).await;
    let head = queue.record().record_queue[0].clone();
    h.remote
        .fail_next_upload(RemoteError::Network("connection reset".into()));

    assert_eq!(
        queue.tick().await.unwrap(),
        TickOutcome::Retry(ErrorKind::Network)
    );
    let record = persisted(&h, &queue).await.unwrap();
    assert!(record.network_down);
    assert_eq!(record.record_queue.front(), Some(&head));
    assert_eq!(record.uploaded_size, 0);
    assert!(h.store.get(&head).await.unwrap().is_some());

    assert!(matches!(
        queue.tick().await.unwrap(),
        TickOutcome::Uploaded { .. }
    ));
    assert!(!persisted(&h, &queue).await.unwrap().network_down);
    assert!(h.store.get(&head).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_credentials_are_refreshed_once() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[3]).await;
    h.remote
        .fail_next_upload(RemoteError::CredentialsExpired("ExpiredToken".into()));

    assert!(matches!(
        queue.tick().await.unwrap(),
        TickOutcome::Uploaded { .. }
    ));
    assert_eq!(h.remote.refreshes(), 1);
}

#[tokio::test]
async fn test_sign_failure_retries_signing_only() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Video, &[3]).await;
    queue.mark_stopped().await.unwrap();
    h.remote
        .fail_next_sign(RemoteError::Network("timeout".into()));

    let outcomes = drive(&h, &mut queue, 10).await;
    assert!(outcomes.contains(&TickOutcome::Retry(ErrorKind::Network)));
    assert!(matches!(outcomes.last(), Some(TickOutcome::Completed(_))));
    assert_eq!(h.remote.concat_calls(), 1);
}

#[tokio::test]
async fn test_flush_marker_deletes_queue() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[3, 3]).await;
    assert!(queue.lease().try_acquire().await.unwrap().is_owned());
    let flush_key = queue.record().flush_key.clone();
    let marker = FlushMarker { seen: false }.encode(&flush_key).unwrap();
    h.store.put(&flush_key, &marker, None).await.unwrap();

    assert_eq!(
        queue.tick().await.unwrap(),
        TickOutcome::Finished(QueueStatus::Delete)
    );
    assert!(h.store.keys_with_prefix("Blob_").is_empty());
    assert!(h.store.keys_with_prefix("Queue_").is_empty());
    assert!(h.store.keys_with_prefix("Lock_").is_empty());

    let raw = h.store.get(&flush_key).await.unwrap().unwrap();
    assert!(FlushMarker::decode(&flush_key, &raw).unwrap().seen);
}

#[tokio::test]
async fn test_flush_marker_consumed_exactly_once() {
    let h = Harness::new();
    let mut first = queue_with_chunks(&h, "d1", QueueKind::Audio, &[3]).await;
    first.mark_stopped().await.unwrap();
    let mut second = Queue::from_record(first.record().clone(), h.deps());

    let flush_key = first.record().flush_key.clone();
    let marker = FlushMarker { seen: false }.encode(&flush_key).unwrap();
    h.store.put(&flush_key, &marker, None).await.unwrap();

    let (a, b) = tokio::join!(first.tick(), second.tick());
    let deletes = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(|o| *o == TickOutcome::Finished(QueueStatus::Delete))
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn test_empty_chunk_is_stale_capture() {
    let h = Harness::new();
    let mut queue = h.queue("d1", QueueKind::Audio);
    queue.start().await.unwrap();

    let err = queue.handle_chunk(Bytes::new()).await.unwrap_err();
    assert!(matches!(err, QueueError::StaleCapture));
    assert!(queue.record().record_queue.is_empty());
}

#[tokio::test]
async fn test_dismiss_flushes_and_discards_later_chunks() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Screen, &[2, 2, 2]).await;
    assert!(queue.lease().try_acquire().await.unwrap().is_owned());

    queue.dismiss().await.unwrap();
    assert!(h.store.is_empty());
    assert_eq!(queue.status(), QueueStatus::Delete);

    assert_eq!(
        queue.handle_chunk(Bytes::from_static(b"late")).await.unwrap(),
        None
    );
    assert!(h.store.is_empty());
    assert_eq!(queue.tick().await.unwrap(), TickOutcome::Finished(QueueStatus::Delete));
}

#[tokio::test]
async fn test_chunk_keys_unique_within_one_millisecond() {
    let h = Harness::new();
    let queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[1, 1, 1]).await;

    let keys: Vec<&String> = queue.record().record_queue.iter().collect();
    assert_eq!(keys.len(), 3);
    assert!(keys[0] < keys[1] && keys[1] < keys[2]);
    assert_eq!(h.store.keys_with_prefix("Blob_d1_audio_").len(), 3);
}

#[tokio::test]
async fn test_chunks_rejected_once_stitching() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[1]).await;
    queue.mark_stopped().await.unwrap();
    drive(&h, &mut queue, 2).await;
    assert_eq!(queue.status(), QueueStatus::Stitching);

    let err = queue
        .handle_chunk(Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::NotAccepting {
            status: QueueStatus::Stitching,
            ..
        }
    ));
}

#[tokio::test]
async fn test_resume_of_deleted_record_flushes() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[1]).await;
    let key = queue.record().queue_key.clone();
    h.store.delete(&key).await.unwrap();

    queue.resume().await.unwrap();
    assert_eq!(queue.status(), QueueStatus::Delete);
    assert_eq!(queue.tick().await.unwrap(), TickOutcome::Finished(QueueStatus::Delete));
    assert!(h.store.keys_with_prefix("Blob_").is_empty());
}

#[tokio::test]
async fn test_content_type_and_paths_are_persisted() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Screen, &[1]).await;
    queue.mark_stopped().await.unwrap();

    let record = persisted(&h, &queue).await.unwrap();
    assert_eq!(record.content_type, "video/webm");
    assert_eq!(record.upload_path, "uploads/d1/screen");
    assert!(record.was_stopped);
    assert!(!record.live_queue);
    assert!(record.end_time >= record.start_time);

    drive(&h, &mut queue, 10).await;
    assert!(queue.record().media_keys[0].starts_with("uploads/d1/screen/"));
    assert!(queue.record().media_keys[0].ends_with("_0.webm"));
}

#[tokio::test]
async fn test_sign_failures_count_toward_stitch_bound() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[4]).await;
    queue.mark_stopped().await.unwrap();
    for _ in 0..11 {
        h.remote
            .fail_next_sign(RemoteError::remote("signature rejected", false));
    }

    let outcomes = drive(&h, &mut queue, 30).await;
    assert_eq!(outcomes.last(), Some(&TickOutcome::Finished(QueueStatus::Error)));
    assert_eq!(queue.record().error_invoking_concat, 11);
    assert_eq!(h.remote.concat_calls(), 1);
    assert!(queue.record().extra_info.concat_url.is_some());
}

#[tokio::test]
async fn test_chunk_accepted_while_upload_is_out() {
    let h = Harness::new();
    let mut queue = queue_with_chunks(&h, "d1", QueueKind::Audio, &[5]).await;
    let head = queue.record().record_queue[0].clone();

    let TickStep::Remote(call) = queue.begin_tick().await.unwrap() else {
        panic!("expected an upload to be handed out");
    };
    assert_eq!(queue.upload_status(), ActivityStatus::Active);
    // A second tick does not start another upload
    assert!(matches!(
        queue.begin_tick().await.unwrap(),
        TickStep::Done(TickOutcome::Idle)
    ));

    let late = queue
        .handle_chunk(Bytes::from_static(b"late"))
        .await
        .unwrap()
        .unwrap();
    assert!(h.store.get(&late).await.unwrap().is_some());

    let reply = call.run(h.remote.as_ref()).await;
    assert!(matches!(
        queue.finish_tick(reply).await.unwrap(),
        TickOutcome::Uploaded { .. }
    ));
    assert_eq!(queue.upload_status(), ActivityStatus::Inactive);
    assert!(h.store.get(&head).await.unwrap().is_none());
    let pending: Vec<&String> = queue.record().record_queue.iter().collect();
    assert_eq!(pending, vec![&late]);
    assert_eq!(queue.record().total_size, 9);
    assert_eq!(queue.record().uploaded_size, 5);
}
