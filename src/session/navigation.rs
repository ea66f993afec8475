use crate::domain::types::{NavTarget, QuestionKind, SyncState};
use crate::session::store::SessionState;

/// Whether the student may move from question `from` to question `to`.
///
/// A timed capture on the current question blocks every move. A saved
/// spoken answer locks everything before it.
pub fn can_navigate(state: &SessionState, from: usize, to: usize) -> bool {
    let Some(current) = state.questions.get(from) else {
        return false;
    };
    if to >= state.questions.len() {
        return false;
    }
    if state.capture(&current.id).is_some_and(|capture| capture.state.blocks_navigation()) {
        return false;
    }
    if to < from && is_locked_spoken_answer(state, from) {
        return false;
    }
    true
}

fn is_locked_spoken_answer(state: &SessionState, index: usize) -> bool {
    state.questions.get(index).is_some_and(|question| {
        question.kind == QuestionKind::SpokenAudio
            && state
                .answer(&question.id)
                .is_some_and(|answer| answer.sync_state == SyncState::Saved)
    })
}

/// Index `target` points at from `current`, if it exists.
pub fn resolve_target(current: usize, target: NavTarget, len: usize) -> Option<usize> {
    let index = match target {
        NavTarget::Next => current.checked_add(1)?,
        NavTarget::Previous => current.checked_sub(1)?,
        NavTarget::Index(index) => index,
    };
    (index < len).then_some(index)
}
