use std::time::Duration;

use super::harness;
use crate::core::errors::{ErrorClass, SessionError};
use crate::domain::models::AnswerPayload;
use crate::domain::types::{AttemptMode, AttemptType, QuestionKind, SessionPhase, Skill, SyncState};
use crate::schemas::attempt::{RemoteAttemptStatus, SavedAnswerRecord};
use crate::test_support::{attempt_record, question, TEST_ATTEMPT_ID, TEST_EXAM_ID};

#[tokio::test(start_paused = true)]
async fn entry_without_mode_waits_for_selection() {
    let h = harness(vec![question("q1", 1, QuestionKind::FreeText)]);

    let state = h.controller.resolve_entry(TEST_EXAM_ID, None, None).await.unwrap();
    assert_eq!(state.phase, SessionPhase::AwaitingModeSelection);
    assert_eq!(state.available_skills, vec![Skill::Reading, Skill::Speaking]);
    assert!(state.attempt.is_none());

    let err = h.controller.start_attempt(AttemptMode::SingleSkill(Skill::Writing)).await.unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));
    assert_eq!(h.controller.state().phase, SessionPhase::AwaitingModeSelection);

    let state = h.controller.start_attempt(AttemptMode::FullExam).await.unwrap();
    assert_eq!(state.phase, SessionPhase::Active);
    let attempt = state.attempt.unwrap();
    assert_eq!(attempt.attempt_type, AttemptType::FullExam);
    assert_eq!(attempt.selected_skill, None);
    assert!(attempt.timer_initialized);

    assert!(matches!(
        h.controller.resolve_entry(TEST_EXAM_ID, None, None).await,
        Err(SessionError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn resume_restores_saved_answers_and_position() {
    let h = harness(vec![
        question("q2", 2, QuestionKind::FreeText),
        question("q1", 1, QuestionKind::FreeText),
    ]);
    let mut record = attempt_record(Some(900));
    record.saved_answers = vec![SavedAnswerRecord {
        question_id: "q1".into(),
        answer: AnswerPayload::FreeText("My introduction".into()),
        saved_at: Some("2026-03-01T09:30:00Z".into()),
    }];
    h.api.with_fetched(record);

    let state = h
        .controller
        .resolve_entry(TEST_EXAM_ID, Some(TEST_ATTEMPT_ID), None)
        .await
        .expect("resumed");
    assert_eq!(state.phase, SessionPhase::Active);
    assert_eq!(state.questions[0].id, "q1");
    assert_eq!(state.current_index, 1);
    assert_eq!(state.attempt.as_ref().unwrap().time_remaining_seconds, 900);
    let restored = state.answer("q1").unwrap();
    assert_eq!(restored.sync_state, SyncState::Saved);
    assert_eq!(restored.answered_at.hour(), 9);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.controller.state().attempt.unwrap().time_remaining_seconds, 898);
}

#[tokio::test(start_paused = true)]
async fn resume_without_remaining_time_is_fatal() {
    let h = harness(vec![question("q1", 1, QuestionKind::FreeText)]);
    h.api.with_fetched(attempt_record(None));

    let err = h
        .controller
        .resolve_entry(TEST_EXAM_ID, Some(TEST_ATTEMPT_ID), None)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Initialization);

    let state = h.controller.state();
    assert_eq!(state.phase, SessionPhase::Error);
    assert!(state.attempt.is_none());
    assert!(state.questions.is_empty());
    assert_eq!(state.error.unwrap().class, ErrorClass::Initialization);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.controller.state().attempt.is_none());
    assert!(h.controller.edit_answer("q1", &serde_json::json!("x")).is_err());
}

#[tokio::test(start_paused = true)]
async fn resume_rejects_closed_or_foreign_attempts() {
    let h = harness(vec![question("q1", 1, QuestionKind::FreeText)]);
    h.api.with_fetched(attempt_record(Some(600)));
    let err = h.controller.resolve_entry("exam-2", Some(TEST_ATTEMPT_ID), None).await.unwrap_err();
    assert!(matches!(err, SessionError::Initialization(_)));

    h.controller.exit();
    let mut submitted = attempt_record(Some(600));
    submitted.status = RemoteAttemptStatus::Submitted;
    h.api.with_fetched(submitted);
    let err = h
        .controller
        .resolve_entry(TEST_EXAM_ID, Some(TEST_ATTEMPT_ID), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Initialization(_)));
}

#[tokio::test(start_paused = true)]
async fn create_without_remaining_time_fetches_once() {
    let h = harness(vec![question("q1", 1, QuestionKind::FreeText)]);
    h.api.with_created(attempt_record(None));
    h.api.with_fetched(attempt_record(Some(300)));

    let state = h.start_speaking().await;
    assert_eq!(state.attempt.unwrap().time_remaining_seconds, 300);
    assert_eq!(h.api.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn create_failure_leaves_session_in_error() {
    let h = harness(vec![question("q1", 1, QuestionKind::FreeText)]);
    h.api.fail_create(SessionError::Network("connection reset".into()));

    let err = h
        .controller
        .resolve_entry(TEST_EXAM_ID, None, Some(AttemptMode::FullExam))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Network);
    let state = h.controller.state();
    assert_eq!(state.phase, SessionPhase::Error);
    assert_eq!(state.error.unwrap().class, ErrorClass::Network);
}

#[tokio::test(start_paused = true)]
async fn attempt_without_questions_cannot_start() {
    let h = harness(Vec::new());
    let err = h
        .controller
        .resolve_entry(TEST_EXAM_ID, None, Some(AttemptMode::FullExam))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Initialization(_)));
    assert_eq!(h.controller.state().phase, SessionPhase::Error);
}

#[tokio::test(start_paused = true)]
async fn calibration_is_remembered_per_exam_and_mode() {
    let h = harness(vec![question("q1", 1, QuestionKind::SpokenAudio)]);
    h.start_speaking().await;
    assert!(h.controller.calibration_required().unwrap());
    h.controller.complete_calibration().unwrap();
    assert!(!h.controller.calibration_required().unwrap());

    let reopened = h.reopen();
    reopened
        .resolve_entry(TEST_EXAM_ID, None, Some(AttemptMode::SingleSkill(Skill::Speaking)))
        .await
        .unwrap();
    assert!(!reopened.calibration_required().unwrap());

    let full = h.reopen();
    full.resolve_entry(TEST_EXAM_ID, None, Some(AttemptMode::FullExam)).await.unwrap();
    assert!(full.calibration_required().unwrap());
}

#[tokio::test(start_paused = true)]
async fn exit_stops_background_work_and_releases_device() {
    let h = harness(vec![question("q1", 1, QuestionKind::SpokenAudio)]);
    h.start_speaking().await;
    h.controller.start_capture().unwrap();
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(h.device.starts(), 1);

    h.controller.exit();
    let state = h.controller.state();
    assert_eq!(state.phase, SessionPhase::Uninitialized);
    assert!(state.attempt.is_none());
    assert!(state.captures.is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.device.stops(), 1);
    assert!(h.api.upload_calls().is_empty());
    assert!(h.controller.state().attempt.is_none());

    let state = h.start_speaking().await;
    assert_eq!(state.phase, SessionPhase::Active);
    h.controller.start_capture().expect("device is free again");
}
