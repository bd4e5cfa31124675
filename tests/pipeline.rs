//! End-to-end behaviour of `PdfProcessor` over dedicated engines.
//!
//! Every test drives the real pool, worker and engine-host threads; only the
//! engine itself is scripted.

use pdfraster::testing::{pdf_bytes, EngineProbe, EngineScript};
use pdfraster::{
    CacheKey, DisplayInfo, ErrorKind, EventKind, ImageReleaser, PageImage, PdfProcessor,
    PipelineConfig, PipelineConfigBuilder, ProcessorStats, RecoveryBus, RecoveryEvent, WorkerPool,
    SYSTEM_ERROR_MESSAGE,
};
use pdfraster::protocol::{DocumentId, RequestId, WorkerMessage, WorkerRequest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

fn config() -> PipelineConfigBuilder {
    PipelineConfig::builder().retry_base_delay_ms(1)
}

/// Route library logs to the test harness; `RUST_LOG=pdfraster=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pool(script: EngineScript, config: PipelineConfig) -> (Arc<WorkerPool>, Arc<EngineProbe>) {
    init_tracing();
    let (factory, probe) = script.into_factory();
    (WorkerPool::with_bus(config, factory, RecoveryBus::default()), probe)
}

async fn opened(pool: &Arc<WorkerPool>, pages: usize) -> Arc<PdfProcessor> {
    let processor = PdfProcessor::new(Arc::clone(pool), "doc.pdf").await.unwrap();
    let info = processor.process_file(pdf_bytes(pages)).await.unwrap();
    assert_eq!(info.total_pages, pages);
    Arc::new(processor)
}

/// Poll the processor until `done` holds, failing after two seconds.
async fn wait_until(processor: &PdfProcessor, done: impl Fn(&ProcessorStats) -> bool) -> ProcessorStats {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stats = processor.stats().await.unwrap();
        if done(&stats) {
            return stats;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not reached: {stats:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn spawn_get(processor: &Arc<PdfProcessor>, page: usize) -> tokio::task::JoinHandle<pdfraster::PageResult> {
    let processor = Arc::clone(processor);
    tokio::spawn(async move { processor.get_page(page).await })
}

#[tokio::test]
async fn concurrent_requests_for_one_page_share_a_render() {
    let (pool, probe) = pool(EngineScript::new(3), config().build().unwrap());
    let processor = opened(&pool, 3).await;

    probe.gate().close();
    let first = spawn_get(&processor, 1);
    let second = spawn_get(&processor, 1);
    wait_until(&processor, |s| s.active == 1).await;
    // Give the second request time to reach the actor and attach.
    tokio::time::sleep(Duration::from_millis(20)).await;
    probe.gate().open();

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(probe.renders_of(1), 1);
    assert_eq!(processor.stats().await.unwrap().dispatched, 1);
}

#[tokio::test]
async fn cache_hit_skips_engine_and_idle_pages_expire() {
    let (pool, probe) = pool(
        EngineScript::new(2),
        config()
            .cache_max_age_ms(50)
            .cache_sweep_interval_ms(10)
            .build()
            .unwrap(),
    );
    let released = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&released);
    let releaser: Arc<dyn ImageReleaser> = Arc::new(move |key: &CacheKey, _image: &PageImage| {
        sink.lock().unwrap().push(key.page_number);
    });
    let processor = PdfProcessor::with_releaser(pool, "ttl.pdf", Some(releaser))
        .await
        .unwrap();
    processor.process_file(pdf_bytes(2)).await.unwrap();

    let miss = processor.get_page(1).await.unwrap();
    let hit = processor.get_page(1).await.unwrap();
    assert_eq!(miss, hit);
    assert_eq!(probe.renders_of(1), 1);
    let stats = processor.stats().await.unwrap();
    assert_eq!((stats.cached, stats.cache_hits), (1, 1));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(processor.stats().await.unwrap().cached, 0);
    assert_eq!(*released.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn in_flight_renders_never_exceed_the_cap() {
    let (pool, probe) = pool(
        EngineScript::new(10).render_delay(Duration::from_millis(5)),
        config().default_concurrency(3).build().unwrap(),
    );
    let processor = opened(&pool, 10).await;

    let report = processor.render_all().await.unwrap();
    assert!(report.is_complete());
    let stats = processor.stats().await.unwrap();
    assert_eq!(stats.peak_active, 3);
    assert_eq!(stats.dispatched, 10);
    assert_eq!(probe.renders(), 10);
}

#[tokio::test]
async fn concurrency_changes_are_clamped() {
    let (pool, _probe) = pool(EngineScript::new(1), config().build().unwrap());
    let processor = opened(&pool, 1).await;
    assert_eq!(processor.set_max_concurrent(100).await.unwrap(), 8);
    assert_eq!(processor.set_max_concurrent(0).await.unwrap(), 1);
    assert_eq!(processor.stats().await.unwrap().max_concurrent, 1);
}

#[tokio::test]
async fn abort_rejects_queued_and_in_flight_pages_once() {
    let (pool, probe) = pool(
        EngineScript::new(5),
        config().default_concurrency(2).build().unwrap(),
    );
    let processor = opened(&pool, 5).await;

    probe.gate().close();
    let pending: Vec<_> = (1..=3).map(|p| spawn_get(&processor, p)).collect();
    wait_until(&processor, |s| s.active == 2 && s.queued == 1).await;

    assert_eq!(processor.abort().await, 3);
    for handle in pending {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Abort);
    }
    assert_eq!(processor.abort().await, 0);

    let stats = processor.stats().await.unwrap();
    assert_eq!((stats.active, stats.queued, stats.cached), (0, 0, 0));
    let err = processor.get_page(1).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::WorkerInit);
    probe.gate().open();
}

#[tokio::test]
async fn renders_finishing_after_abort_reach_the_recovery_bus() {
    let (factory, probe) = EngineScript::new(3).into_factory();
    let bus = RecoveryBus::new(Duration::from_secs(60));
    let pool = WorkerPool::with_bus(config().build().unwrap(), factory, bus.clone());
    let processor = opened(&pool, 3).await;

    probe.gate().close();
    let pending = spawn_get(&processor, 1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while probe.gate().held() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "render never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(processor.abort().await, 1);
    assert_eq!(pending.await.unwrap().unwrap_err().kind, ErrorKind::Abort);

    let mut recovered = bus.subscribe_stream(EventKind::PageProcessed);
    probe.gate().open();
    let event = tokio::time::timeout(Duration::from_secs(2), recovered.next())
        .await
        .expect("late render published")
        .unwrap();
    match event {
        RecoveryEvent::PageProcessed { image } => assert_eq!(image.page_number, 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(probe.renders_of(1), 1);
    assert_eq!(processor.stats().await.unwrap().cached, 0);
}

#[tokio::test]
async fn replaced_document_results_are_not_recovered() {
    let (factory, probe) = EngineScript::new(3).into_factory();
    let bus = RecoveryBus::new(Duration::from_secs(60));
    let pool = WorkerPool::with_bus(config().build().unwrap(), factory, bus.clone());
    let processor = opened(&pool, 3).await;

    probe.gate().close();
    let pending = spawn_get(&processor, 2);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while probe.gate().held() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "render never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let replacing = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move { processor.process_file(pdf_bytes(2)).await })
    };
    assert_eq!(pending.await.unwrap().unwrap_err().kind, ErrorKind::Abort);
    probe.gate().open();
    assert_eq!(replacing.await.unwrap().unwrap().total_pages, 2);

    processor.get_page(1).await.unwrap();
    assert_eq!(bus.retained_count(), 0);
}

#[tokio::test]
async fn failing_pages_do_not_fail_the_document() {
    let (pool, probe) = pool(
        EngineScript::new(10).failing([3, 7]),
        config().max_retries(3).build().unwrap(),
    );
    let processor = opened(&pool, 10).await;

    let report = processor.render_all().await.unwrap();
    assert_eq!(report.failed.keys().copied().collect::<Vec<_>>(), vec![3, 7]);
    assert_eq!(report.rendered.len(), 8);
    assert_eq!(report.outcome().unwrap_err().kind, ErrorKind::PdfSomePagesFailed);
    assert_eq!(report.failed[&3].kind, ErrorKind::PdfPageRender);

    // One first attempt plus three retries.
    assert_eq!(probe.renders_of(3), 4);
    assert_eq!(probe.renders_of(1), 1);

    let stats = processor.stats().await.unwrap();
    assert_eq!(stats.cached, 8);
    assert_eq!(stats.failed_pages, 2);
    let errors = processor.errors().await.unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.file_name == "doc.pdf"));

    // The successful pages are served from the cache with their dimensions.
    for page in (1..=10).filter(|p| *p != 3 && *p != 7) {
        let image = processor.get_page(page).await.unwrap();
        let rendered = report.rendered.iter().find(|r| r.page_number == page).unwrap();
        assert_eq!((image.width, image.height), (rendered.width, rendered.height));
        assert!(image.width > 0 && image.height > 0);
    }
    let after = processor.stats().await.unwrap();
    assert_eq!(after.cache_hits, 8);
    assert_eq!(after.dispatched, stats.dispatched);
}

#[tokio::test]
async fn every_page_failing_is_all_pages_failed() {
    let (pool, _probe) = pool(
        EngineScript::new(2).failing([1, 2]),
        config().max_retries(0).build().unwrap(),
    );
    let processor = opened(&pool, 2).await;
    let report = processor.render_all().await.unwrap();
    assert_eq!(report.outcome().unwrap_err().kind, ErrorKind::PdfAllPagesFailed);
}

#[tokio::test]
async fn flaky_page_succeeds_after_retries() {
    let (pool, probe) = pool(
        EngineScript::new(3).flaky(2, 2),
        config().build().unwrap(),
    );
    let processor = opened(&pool, 3).await;

    let image = processor.get_page(2).await.unwrap();
    assert_eq!(&*image.data, b"page-2");
    assert_eq!(probe.renders_of(2), 3);
    let stats = processor.stats().await.unwrap();
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.failed_pages, 0);
    assert!(processor.errors().await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_panic_fails_only_that_page() {
    let (pool, _probe) = pool(
        EngineScript::new(3).panic_on(2),
        config().max_retries(1).build().unwrap(),
    );
    let processor = opened(&pool, 3).await;

    let err = processor.get_page(2).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PdfPageRender);
    assert_eq!(err.page_number, Some(2));
    assert!(processor.get_page(3).await.is_ok());
}

#[tokio::test]
async fn stalled_render_times_out() {
    let (pool, probe) = pool(
        EngineScript::new(2),
        config().request_timeout_ms(50).max_retries(0).build().unwrap(),
    );
    let processor = opened(&pool, 2).await;

    probe.gate().close();
    let err = processor.get_page(1).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::WorkerTimeout);
    assert_eq!(processor.stats().await.unwrap().active, 0);
    probe.gate().open();
}

#[tokio::test]
async fn document_lifecycle_end_to_end() {
    let (pool, probe) = pool(EngineScript::new(5), config().build().unwrap());
    let processor = opened(&pool, 5).await;

    // Miss, then hit.
    processor.get_page(2).await.unwrap();
    processor.get_page(2).await.unwrap();
    assert_eq!(probe.renders_of(2), 1);
    assert_eq!(processor.stats().await.unwrap().cache_hits, 1);

    probe.gate().close();
    let pending: Vec<_> = (3..=5).map(|p| spawn_get(&processor, p)).collect();
    wait_until(&processor, |s| s.active == 3).await;
    assert_eq!(processor.abort().await, 3);
    for handle in pending {
        assert_eq!(handle.await.unwrap().unwrap_err().kind, ErrorKind::Abort);
    }
    probe.gate().open();

    processor.cleanup().await;
    assert_eq!(pool.stats().workers, 0);
}

#[tokio::test]
async fn invalid_documents_are_rejected_at_open() {
    let (pool, probe) = pool(EngineScript::new(3), config().max_file_size(64).build().unwrap());
    let processor = PdfProcessor::new(pool, "big.pdf").await.unwrap();

    let err = processor.process_file(vec![b'%'; 65]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PdfMemory);
    assert_eq!(probe.opens(), 0);

    let err = processor.process_file(b"hello".to_vec()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PdfFormat);

    let err = processor.process_file(pdf_bytes(0)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PdfFormat);

    let err = processor.get_page(1).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::WorkerInit);
    assert_eq!(processor.errors().await.unwrap().len(), 3);
}

#[tokio::test]
async fn out_of_range_pages_are_rejected() {
    let (pool, probe) = pool(EngineScript::new(2), config().build().unwrap());
    let processor = opened(&pool, 2).await;
    for page in [0, 3] {
        let err = processor.get_page(page).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PdfPageRender);
    }
    assert_eq!(probe.renders(), 0);
}

#[tokio::test]
async fn replacing_the_document_drops_cached_pages() {
    let (pool, _probe) = pool(EngineScript::new(3), config().build().unwrap());
    let processor = opened(&pool, 3).await;
    let first = processor.get_page(1).await.unwrap();

    let info = processor.process_file(pdf_bytes(5)).await.unwrap();
    assert_ne!(info.document_id, first.document_id);
    let stats = processor.stats().await.unwrap();
    assert_eq!((stats.total_pages, stats.cached), (Some(5), 0));

    let page = processor.get_page(5).await.unwrap();
    assert_eq!(page.document_id, info.document_id);
}

#[tokio::test]
async fn display_change_clears_the_cache() {
    let (pool, _probe) = pool(EngineScript::new(2), config().build().unwrap());
    let processor = opened(&pool, 2).await;
    let wide = processor.get_page(1).await.unwrap();
    assert_eq!(processor.stats().await.unwrap().cached, 1);

    processor.set_display_info(Some(DisplayInfo {
        viewport_width: 300,
        viewport_height: 200,
        device_pixel_ratio: 1.0,
    }));
    assert_eq!(processor.stats().await.unwrap().cached, 0);

    let narrow = processor.get_page(1).await.unwrap();
    assert!(narrow.height < wide.height, "{narrow:?} vs {wide:?}");
}

#[tokio::test]
async fn cleanup_is_idempotent_and_final() {
    let (pool, _probe) = pool(EngineScript::new(2), config().build().unwrap());
    let processor = opened(&pool, 2).await;
    assert_eq!(pool.stats().workers, 1);

    processor.cleanup().await;
    processor.cleanup().await;
    assert_eq!(pool.stats().workers, 0);
    assert_eq!(processor.get_page(1).await.unwrap_err().kind, ErrorKind::WorkerInit);
    assert_eq!(processor.stats().await.unwrap_err().kind, ErrorKind::WorkerInit);
}

#[tokio::test]
async fn dropped_processor_frees_its_worker() {
    let (pool, _probe) = pool(
        EngineScript::new(1),
        config().max_workers(1).acquire_timeout_ms(1_000).build().unwrap(),
    );
    let processor = opened(&pool, 1).await;
    drop(processor);

    let next = PdfProcessor::new(Arc::clone(&pool), "next.pdf").await.unwrap();
    next.process_file(pdf_bytes(1)).await.unwrap();
}

#[tokio::test]
async fn exhausted_pool_rejects_new_processors() {
    let (pool, _probe) = pool(
        EngineScript::new(1),
        config().max_workers(1).acquire_timeout_ms(50).build().unwrap(),
    );
    let _held = opened(&pool, 1).await;
    let err = PdfProcessor::new(Arc::clone(&pool), "late.pdf").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::WorkerPool);
}

#[tokio::test]
async fn terminate_all_aborts_in_flight_requests() {
    let (pool, probe) = pool(EngineScript::new(2), config().build().unwrap());
    let processor = opened(&pool, 2).await;

    probe.gate().close();
    let pending = spawn_get(&processor, 1);
    wait_until(&processor, |s| s.active == 1).await;

    pool.terminate_all();
    pool.terminate_all();
    assert_eq!(pending.await.unwrap().unwrap_err().kind, ErrorKind::Abort);
    probe.gate().open();

    let err = PdfProcessor::new(Arc::clone(&pool), "after.pdf").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::WorkerPool);
    assert!(pool.stats().terminated);
}

#[tokio::test]
async fn terminate_all_aborts_queued_pages_without_retrying() {
    let (pool, probe) = pool(
        EngineScript::new(3),
        config().default_concurrency(1).build().unwrap(),
    );
    let processor = opened(&pool, 3).await;

    probe.gate().close();
    let in_flight = spawn_get(&processor, 1);
    let queued = spawn_get(&processor, 2);
    wait_until(&processor, |s| s.active == 1 && s.queued == 1).await;

    pool.terminate_all();
    let started = tokio::time::Instant::now();
    assert_eq!(in_flight.await.unwrap().unwrap_err().kind, ErrorKind::Abort);
    assert_eq!(queued.await.unwrap().unwrap_err().kind, ErrorKind::Abort);
    assert!(started.elapsed() < Duration::from_millis(250));
    probe.gate().open();

    let stats = processor.stats().await.unwrap();
    assert_eq!((stats.failed_pages, stats.dispatched), (0, 1));
    assert_eq!(probe.renders_of(2), 0);
    assert_eq!(processor.get_page(3).await.unwrap_err().kind, ErrorKind::WorkerInit);
}

#[tokio::test]
async fn internal_errors_are_masked_for_users() {
    let (pool, probe) = pool(
        EngineScript::new(2).failing([2]),
        config()
            .request_timeout_ms(50)
            .max_retries(0)
            .mask_internal_errors(true)
            .build()
            .unwrap(),
    );
    let processor = opened(&pool, 2).await;

    let content = processor.get_page(2).await.unwrap_err();
    assert!(processor.describe_error(&content).contains("bitmap error"));

    probe.gate().close();
    let stalled = processor.get_page(1).await.unwrap_err();
    probe.gate().open();
    assert_eq!(stalled.kind, ErrorKind::WorkerTimeout);
    assert_eq!(processor.describe_error(&stalled), SYSTEM_ERROR_MESSAGE);
    // The structured error keeps its detail.
    assert!(stalled.message.contains("did not render"));
}

#[tokio::test]
async fn internal_errors_are_detailed_without_masking() {
    let (pool, probe) = pool(
        EngineScript::new(1),
        config().request_timeout_ms(50).max_retries(0).build().unwrap(),
    );
    let processor = opened(&pool, 1).await;

    probe.gate().close();
    let stalled = processor.get_page(1).await.unwrap_err();
    probe.gate().open();
    let shown = processor.describe_error(&stalled);
    assert!(shown.contains("WorkerTimeout") && shown.contains("did not render"), "{shown}");
}

#[tokio::test]
async fn zero_sweep_interval_from_raw_config_still_runs() {
    let raw = PipelineConfig {
        cache_sweep_interval_ms: 0,
        ..PipelineConfig::default()
    };
    assert!(raw.validate().is_err());
    let (pool, _probe) = pool(EngineScript::new(2), raw);
    let processor = opened(&pool, 2).await;

    processor.get_page(1).await.unwrap();
    assert_eq!(pool.stats().workers, 1);
    processor.cleanup().await;
    assert_eq!(pool.stats().workers, 0);
}

#[tokio::test]
async fn replies_without_a_requester_reach_the_recovery_bus() {
    let (factory, _probe) = EngineScript::new(4).into_factory();
    let bus = RecoveryBus::new(Duration::from_secs(60));
    let pool = WorkerPool::with_bus(config().build().unwrap(), factory, bus.clone());

    let worker = pool.acquire_worker().await.unwrap();
    let (reply_to, replies) = tokio::sync::mpsc::unbounded_channel();
    drop(replies);
    worker
        .send(
            WorkerMessage {
                request_id: RequestId(1),
                document_id: DocumentId(42),
                request: WorkerRequest::InitPdf {
                    bytes: pdf_bytes(4).into(),
                },
            },
            reply_to,
        )
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while bus.retained_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "nothing published");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let _subscription = bus.subscribe(EventKind::PdfInitialized, move |event| {
        if let RecoveryEvent::PdfInitialized {
            document_id,
            total_pages,
        } = event
        {
            assert_eq!((*document_id, *total_pages), (DocumentId(42), 4));
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
