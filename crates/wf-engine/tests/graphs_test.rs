mod support;

use std::sync::Arc;

use wf_core::types::{Edge, ExecutionStatus, ExternalInputs, GraphStatus, TaskGraph};
use wf_engine::graphs::GraphServiceError;
use wf_engine::GraphService;

use support::{context, unit, ScriptedRunner};

fn pipeline() -> TaskGraph {
    TaskGraph::new(
        "user_7",
        "quarterly",
        vec![unit("load", "load sales.csv"), unit("report", "summarize")],
        vec![Edge::new("load", "report", "data")],
    )
}

fn service(dir: &std::path::Path) -> (GraphService, Arc<ScriptedRunner>) {
    let runner = Arc::new(
        ScriptedRunner::new()
            .always_ok("load", "processed 120 rows")
            .always_ok("report", "Report generated"),
    );
    let ctx = Arc::new(context(dir, runner.clone()));
    (GraphService::new(ctx), runner)
}

#[tokio::test]
async fn approve_then_execute() {
    let dir = tempfile::tempdir().unwrap();
    let (graphs, runner) = service(dir.path());

    let graph = graphs.create(pipeline()).await.unwrap();
    assert_eq!(graph.status, GraphStatus::Draft);

    let report = graphs.approve(&graph.id).await.unwrap();
    assert!(report.warnings.is_empty());

    let record = graphs.execute(&graph.id, ExternalInputs::default()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.final_output, Some(serde_json::json!("Report generated")));
    assert_eq!(runner.calls().len(), 2);

    let listed = graphs.list_for_user("user_7").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, GraphStatus::Completed);

    let runs = graphs.executions(&graph.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, record.id);
}

#[tokio::test]
async fn failed_run_marks_graph_failed() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(
        ScriptedRunner::new()
            .always_err("load", "FileNotFoundError: 'sales.csv'")
            .always_ok("report", "Report generated"),
    );
    let graphs = GraphService::new(Arc::new(context(dir.path(), runner)));

    let graph = graphs.create(pipeline()).await.unwrap();
    let record = graphs.execute(&graph.id, ExternalInputs::default()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(graphs.list_for_user("user_7").await.unwrap()[0].status, GraphStatus::Failed);
}

#[tokio::test]
async fn cyclic_graph_is_not_approved() {
    let dir = tempfile::tempdir().unwrap();
    let (graphs, runner) = service(dir.path());

    let mut graph = pipeline();
    graph.edges.push(Edge::new("report", "load", "feedback"));
    let graph = graphs.create(graph).await.unwrap();

    match graphs.approve(&graph.id).await {
        Err(GraphServiceError::Invalid(report)) => {
            assert!(report.errors.iter().any(|e| e.contains("circular dependency")));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(graphs.list_for_user("user_7").await.unwrap()[0].status, GraphStatus::Draft);

    assert!(matches!(
        graphs.execute(&graph.id, ExternalInputs::default()).await,
        Err(GraphServiceError::Invalid(_))
    ));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn modify_resets_to_draft() {
    let dir = tempfile::tempdir().unwrap();
    let (graphs, _) = service(dir.path());

    let graph = graphs.create(pipeline()).await.unwrap();
    graphs.approve(&graph.id).await.unwrap();

    let modified = graphs
        .modify(
            &graph.id,
            vec![unit("load", "load q4.csv")],
            vec![],
            Some("single step".into()),
        )
        .await
        .unwrap();
    assert_eq!(modified.status, GraphStatus::Draft);
    assert_eq!(modified.description, "single step");
    assert_eq!(modified.units.len(), 1);
}

#[tokio::test]
async fn running_graph_cannot_be_modified() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let ctx = Arc::new(context(dir.path(), runner));
    let graphs = GraphService::new(ctx.clone());

    let graph = graphs.create(pipeline()).await.unwrap();
    ctx.graphs.update_status(&graph.id, GraphStatus::Running).await.unwrap();

    let err = graphs.modify(&graph.id, vec![], vec![], None).await.unwrap_err();
    assert!(matches!(err, GraphServiceError::Running(ref id) if *id == graph.id));
}

#[tokio::test]
async fn unknown_graph_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (graphs, _) = service(dir.path());
    assert!(matches!(
        graphs.approve("graph_missing").await,
        Err(GraphServiceError::NotFound(_))
    ));
}
