//! Helpers for joining terminating tasks

use tokio::task::JoinError;

// A quietly-cancelled task is a normal shutdown; a panicked task should
// panic the joiner too rather than vanish.
pub(crate) fn check_join(result: Result<(), JoinError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) if err.is_panic() => {
            std::panic::panic_any(err.into_panic());
        }
        Err(err) => {
            panic!("Unexpected join error (other than panic or cancellation): {err}");
        }
    }
}
