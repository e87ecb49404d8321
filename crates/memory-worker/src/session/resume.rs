/// Whether the next model call may continue the recorded model session.
///
/// All three must hold: a model session id was captured, this is not the
/// first turn of the session, and the in-memory state was not rebuilt after
/// a restart (a rebuilt session may carry an id from a provider conversation
/// that no longer matches what the worker has processed).
pub fn should_resume(memory_session_id: Option<&str>, prompt_counter: i64, rehydrated: bool) -> bool {
    let has_id = memory_session_id.map(|id| !id.is_empty()).unwrap_or(false);
    has_id && prompt_counter > 1 && !rehydrated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_truth_table() {
        let cases = [
            // (id, counter, rehydrated, expected)
            (None, 1, false, false),
            (None, 2, false, false),
            (None, 2, true, false),
            (Some("m-1"), 0, false, false),
            (Some("m-1"), 1, false, false),
            (Some("m-1"), 1, true, false),
            (Some("m-1"), 2, true, false),
            (Some("m-1"), 2, false, true),
            (Some("m-1"), 9, false, true),
            (Some(""), 3, false, false),
        ];
        for (id, counter, rehydrated, expected) in cases {
            assert_eq!(
                should_resume(id, counter, rehydrated),
                expected,
                "id={:?} counter={} rehydrated={}",
                id,
                counter,
                rehydrated
            );
        }
    }
}
