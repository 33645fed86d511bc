use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Single-shot alarm that runs a future after a delay unless cancelled.
///
/// Arming replaces any alarm that has not fired yet. The alarm also stands
/// down when the token it was armed with is cancelled.
#[derive(Debug, Default)]
pub struct RetryTimer {
    armed: Option<(CancellationToken, JoinHandle<()>)>,
}

impl RetryTimer {
    pub fn arm<F>(
        &mut self,
        runtime: &Handle,
        cancel: CancellationToken,
        delay: Duration,
        on_fire: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let token = cancel.clone();
        let handle = runtime.spawn(async move {
            tokio::select! {
                biased;

                _ = token.cancelled() => {}

                _ = tokio::time::sleep(delay) => on_fire.await,
            }
        });
        self.armed = Some((cancel, handle));
    }

    /// Returns `true` if an alarm was still pending.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some((token, handle)) => {
                let pending = !handle.is_finished() && !token.is_cancelled();
                token.cancel();
                pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn flag_setter(flag: &Arc<AtomicBool>) -> impl Future<Output = ()> + Send + 'static {
        let flag = flag.clone();
        async move { flag.store(true, Ordering::SeqCst) }
    }

    #[tokio::test]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut timer = RetryTimer::default();
        timer.arm(
            &Handle::current(),
            CancellationToken::new(),
            Duration::from_millis(10),
            flag_setter(&fired),
        );
        assert!(timer.is_armed());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut timer = RetryTimer::default();
        timer.arm(
            &Handle::current(),
            CancellationToken::new(),
            Duration::from_millis(20),
            flag_setter(&fired),
        );
        assert!(timer.cancel());
        assert!(!timer.cancel());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn parent_token_stands_the_alarm_down() {
        let fired = Arc::new(AtomicBool::new(false));
        let parent = CancellationToken::new();
        let mut timer = RetryTimer::default();
        timer.arm(
            &Handle::current(),
            parent.child_token(),
            Duration::from_millis(20),
            flag_setter(&fired),
        );
        parent.cancel();
        assert!(!timer.is_armed());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
