use crate::core::error::TiError;
use crate::core::montage::SimulationMode;
use crate::core::pipeline::{Outcome, PipelineRun, Stage, StageStatus, can_transition};

#[test]
fn happy_path_transitions_are_allowed() {
    let path = [
        (Stage::Queued, Stage::Setup),
        (Stage::Setup, Stage::Visualize),
        (Stage::Visualize, Stage::Solve),
        (Stage::Solve, Stage::ComputeEnvelope),
        (Stage::ComputeEnvelope, Stage::ExtractTissue),
        (Stage::ExtractTissue, Stage::Transform),
        (Stage::Transform, Stage::Verify),
        (Stage::Verify, Stage::Done),
    ];
    for (from, to) in path {
        assert!(
            can_transition(from, to),
            "expected transition {:?} -> {:?} to be allowed",
            from,
            to
        );
    }
}

#[test]
fn skipping_and_going_back_are_refused() {
    assert!(!can_transition(Stage::Setup, Stage::Solve));
    assert!(!can_transition(Stage::Solve, Stage::Visualize));
    assert!(!can_transition(Stage::Transform, Stage::Done));
    assert!(!can_transition(Stage::Setup, Stage::Setup));
    assert!(!can_transition(Stage::Done, Stage::Setup));
}

#[test]
fn stage_names_round_trip() {
    for stage in Stage::PIPELINE {
        assert_eq!(Stage::from_name(stage.as_str()), Some(stage));
    }
    assert_eq!(Stage::from_name("render"), None);
}

#[test]
fn run_refuses_out_of_order_stage() {
    let mut run = PipelineRun::new("m", SimulationMode::Ti);
    assert!(!run.begin(Stage::Solve));
    assert!(run.begin(Stage::Setup));
    assert_eq!(run.record(Stage::Setup).unwrap().status, StageStatus::Running);
}

#[test]
fn first_failure_halts_and_leaves_later_stages_pending() {
    let mut run = PipelineRun::new("m", SimulationMode::Ti);
    run.begin(Stage::Setup);
    run.succeed(Stage::Setup, None);
    run.begin(Stage::Visualize);
    run.succeed(Stage::Visualize, None);
    run.begin(Stage::Solve);
    run.fail(
        Stage::Solve,
        &TiError::ExternalTool {
            tool: "solver".into(),
            status: "exit 1".into(),
            excerpt: "boom".into(),
        },
    );

    assert_eq!(run.outcome, Some(Outcome::Failure));
    let failure = run.failure.clone().unwrap();
    assert_eq!(failure.stage, Stage::Solve);
    assert_eq!(failure.kind, "external_tool");
    assert!(!run.begin(Stage::ComputeEnvelope));
    assert_eq!(
        run.record(Stage::Verify).unwrap().status,
        StageStatus::Pending
    );

    // A later failure never replaces the first one.
    run.fail(Stage::Verify, &TiError::Timeout { seconds: 1 });
    assert_eq!(run.failure.unwrap().stage, Stage::Solve);
}

#[test]
fn complete_requires_every_stage() {
    let mut run = PipelineRun::new("m", SimulationMode::Mti);
    for stage in Stage::PIPELINE {
        assert!(run.begin(stage));
        run.succeed(stage, Some(format!("{} ok", stage.as_str())));
    }
    run.complete();
    assert!(run.is_success());
    assert_eq!(run.position, Stage::Done);

    let mut partial = PipelineRun::new("p", SimulationMode::Ti);
    partial.begin(Stage::Setup);
    partial.succeed(Stage::Setup, None);
    partial.complete();
    assert_eq!(partial.outcome, Some(Outcome::Failure));
    assert_eq!(partial.failure.unwrap().stage, Stage::Visualize);
}

#[test]
fn timeout_is_recorded_on_the_running_stage() {
    let mut run = PipelineRun::new("m", SimulationMode::Ti);
    run.begin(Stage::Setup);
    run.succeed(Stage::Setup, None);
    run.begin(Stage::Visualize);
    run.succeed(Stage::Visualize, None);
    run.begin(Stage::Solve);
    run.fail_current(&TiError::Timeout { seconds: 30 });

    let failure = run.failure.unwrap();
    assert_eq!(failure.stage, Stage::Solve);
    assert_eq!(failure.kind, "timeout");
    assert!(failure.detail.contains("30s"));
}
