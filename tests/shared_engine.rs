//! Processors sharing engines through coordinators.

use futures::future::join_all;
use pdfraster::testing::{pdf_bytes, EngineProbe, EngineScript};
use pdfraster::{
    AssignmentPolicy, EngineStrategy, ErrorKind, PdfProcessor, PipelineConfig, RecoveryBus,
    WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;

fn shared_pool(
    script: EngineScript,
    workers: usize,
    coordinators: usize,
    assignment: AssignmentPolicy,
) -> (Arc<WorkerPool>, Arc<EngineProbe>) {
    let (factory, probe) = script.into_factory();
    let config = PipelineConfig::builder()
        .max_workers(workers)
        .engine_strategy(EngineStrategy::Shared)
        .coordinator_count(coordinators)
        .assignment(assignment)
        .retry_base_delay_ms(1)
        .build()
        .unwrap();
    (WorkerPool::with_bus(config, factory, RecoveryBus::default()), probe)
}

#[tokio::test]
async fn one_engine_serves_every_document_in_turn() {
    let (pool, probe) = shared_pool(
        EngineScript::new(1).render_delay(Duration::from_millis(2)),
        3,
        1,
        AssignmentPolicy::LeastLoaded,
    );

    let mut processors = Vec::new();
    for (i, pages) in [2, 3, 4].into_iter().enumerate() {
        let processor = PdfProcessor::new(Arc::clone(&pool), format!("doc-{i}.pdf"))
            .await
            .unwrap();
        let info = processor.process_file(pdf_bytes(pages)).await.unwrap();
        assert_eq!(info.total_pages, pages);
        processors.push(processor);
    }

    let reports = join_all(processors.iter().map(|p| p.render_all())).await;
    for (report, pages) in reports.into_iter().zip([2, 3, 4]) {
        let report = report.unwrap();
        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.rendered.len(), pages);
    }

    assert_eq!(probe.created(), 1);
    assert_eq!(probe.max_concurrent_renders(), 1);
    assert_eq!(probe.renders(), 9);
    // Interleaved clients force their documents to be re-opened.
    assert!(probe.opens() >= 3);
}

#[tokio::test]
async fn least_loaded_spreads_processors_over_coordinators() {
    let (pool, probe) = shared_pool(EngineScript::new(2), 4, 2, AssignmentPolicy::LeastLoaded);

    let mut processors = Vec::new();
    for i in 0..4 {
        processors.push(
            PdfProcessor::new(Arc::clone(&pool), format!("doc-{i}.pdf"))
                .await
                .unwrap(),
        );
    }

    let statuses = pool.coordinator_statuses().await;
    let clients: Vec<usize> = statuses.iter().map(|s| s.active_clients.len()).collect();
    assert_eq!(clients, vec![2, 2]);
    assert_eq!(probe.created(), 2);
    assert_eq!(pool.stats().coordinators, 2);
}

#[tokio::test]
async fn cleanup_detaches_the_client_from_its_coordinator() {
    let (pool, _probe) = shared_pool(EngineScript::new(2), 2, 1, AssignmentPolicy::RoundRobin);
    let processor = PdfProcessor::new(Arc::clone(&pool), "a.pdf").await.unwrap();
    processor.process_file(pdf_bytes(2)).await.unwrap();
    processor.get_page(1).await.unwrap();

    let statuses = pool.coordinator_statuses().await;
    assert_eq!(statuses[0].active_clients, vec![processor.worker_id()]);

    processor.cleanup().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let statuses = pool.coordinator_statuses().await;
        if statuses[0].active_clients.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "{statuses:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.stats().workers, 0);
}

#[tokio::test]
async fn terminate_all_aborts_requests_waiting_on_a_shared_engine() {
    let (pool, probe) = shared_pool(EngineScript::new(3), 2, 1, AssignmentPolicy::RoundRobin);
    let processor = Arc::new(PdfProcessor::new(Arc::clone(&pool), "a.pdf").await.unwrap());
    processor.process_file(pdf_bytes(3)).await.unwrap();

    probe.gate().close();
    let pending = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move { processor.get_page(2).await })
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while processor.stats().await.unwrap().active == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pool.terminate_all();
    assert_eq!(pending.await.unwrap().unwrap_err().kind, ErrorKind::Abort);
    probe.gate().open();
}

#[tokio::test]
async fn engine_that_cannot_start_fails_acquisition() {
    let (pool, _probe) = shared_pool(
        EngineScript::new(1).fail_create("failed to initialize engine"),
        2,
        1,
        AssignmentPolicy::LeastLoaded,
    );
    let err = PdfProcessor::new(pool, "a.pdf").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::WorkerInit);
}
