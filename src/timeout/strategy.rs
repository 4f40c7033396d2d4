//! Timeout policies and the per-request guard that applies them.
//!
//! Three policies exist:
//! - `Null`: operations block indefinitely
//! - `PerOperation`: each connect/read/write call gets its own budget;
//!   a slow handshake does not consume the read budget
//! - `Global`: a single deadline covers the whole request; once passed,
//!   every subsequent operation fails immediately

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result, TimeoutOp};

/// Duration budgets consumed by policy construction.
///
/// All fields are optional; an absent field means that operation is
/// unbounded under the per-operation policy. `global` feeds the global
/// policy's single deadline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutOptions {
    #[serde(with = "duration_secs_opt")]
    pub connect: Option<Duration>,
    #[serde(with = "duration_secs_opt")]
    pub read: Option<Duration>,
    #[serde(with = "duration_secs_opt")]
    pub write: Option<Duration>,
    #[serde(with = "duration_secs_opt")]
    pub global: Option<Duration>,
}

impl TimeoutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(mut self, d: Duration) -> Self {
        self.connect = Some(d);
        self
    }

    pub fn read(mut self, d: Duration) -> Self {
        self.read = Some(d);
        self
    }

    pub fn write(mut self, d: Duration) -> Self {
        self.write = Some(d);
        self
    }

    pub fn global(mut self, d: Duration) -> Self {
        self.global = Some(d);
        self
    }
}

/// A timeout policy, attached to a client and applied to every request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimeoutPolicy {
    /// Operations block indefinitely.
    #[default]
    Null,
    /// Independent budget per connect/read/write call.
    PerOperation {
        connect: Option<Duration>,
        read: Option<Duration>,
        write: Option<Duration>,
    },
    /// One deadline for the entire request lifecycle.
    Global(Duration),
}

impl TimeoutPolicy {
    /// Build the per-operation policy from options.
    pub fn per_operation(options: &TimeoutOptions) -> Self {
        TimeoutPolicy::PerOperation {
            connect: options.connect,
            read: options.read,
            write: options.write,
        }
    }

    /// Build the global policy from options.
    ///
    /// The total budget is the explicit `global` duration when present,
    /// otherwise the sum of the per-operation durations supplied.
    pub fn global(options: &TimeoutOptions) -> Result<Self> {
        let total = options.global.or_else(|| {
            let parts: Vec<Duration> = [options.connect, options.read, options.write]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.into_iter().sum())
            }
        });
        match total {
            Some(d) => Ok(TimeoutPolicy::Global(d)),
            None => Err(Error::Configuration(
                "global timeout policy requires at least one duration".into(),
            )),
        }
    }

    /// Select a policy by name: `per_operation`, `global`, or `null`.
    ///
    /// Any other name is a configuration error whose message carries the
    /// offending identifier.
    pub fn from_name(name: &str, options: &TimeoutOptions) -> Result<Self> {
        match name {
            "per_operation" => Ok(Self::per_operation(options)),
            "global" => Self::global(options),
            "null" => Ok(TimeoutPolicy::Null),
            other => Err(Error::Configuration(format!(
                "unknown timeout policy \"{other}\" (expected per_operation, global, or null)"
            ))),
        }
    }

    /// Start a guard for one request. For the global policy this is the
    /// moment the deadline is fixed.
    pub fn start(&self) -> TimeoutGuard {
        match self {
            TimeoutPolicy::Null => TimeoutGuard::Null,
            TimeoutPolicy::PerOperation {
                connect,
                read,
                write,
            } => TimeoutGuard::PerOperation {
                connect: *connect,
                read: *read,
                write: *write,
            },
            TimeoutPolicy::Global(total) => TimeoutGuard::Global {
                deadline: Instant::now() + *total,
            },
        }
    }
}

/// Per-request application of a [`TimeoutPolicy`].
///
/// Created once per `perform` call and threaded through every socket
/// operation of that request, including any proxy handshake and lazy
/// body reads.
#[derive(Debug, Clone)]
pub enum TimeoutGuard {
    Null,
    PerOperation {
        connect: Option<Duration>,
        read: Option<Duration>,
        write: Option<Duration>,
    },
    Global {
        deadline: Instant,
    },
}

impl TimeoutGuard {
    /// Run one socket operation under this guard's budget for `op`.
    ///
    /// Under the global policy an already-expired deadline fails without
    /// polling the future at all.
    pub async fn run<T, E, F>(&self, op: TimeoutOp, fut: F) -> Result<T>
    where
        E: Into<Error>,
        F: Future<Output = std::result::Result<T, E>>,
    {
        match self {
            TimeoutGuard::Null => fut.await.map_err(Into::into),
            TimeoutGuard::PerOperation {
                connect,
                read,
                write,
            } => {
                let budget = match op {
                    TimeoutOp::Connect => *connect,
                    TimeoutOp::Read => *read,
                    TimeoutOp::Write => *write,
                };
                match budget {
                    Some(d) => match tokio::time::timeout(d, fut).await {
                        Ok(result) => result.map_err(Into::into),
                        Err(_) => Err(Error::Timeout { op }),
                    },
                    None => fut.await.map_err(Into::into),
                }
            }
            TimeoutGuard::Global { deadline } => {
                if Instant::now() >= *deadline {
                    return Err(Error::Timeout { op });
                }
                match tokio::time::timeout_at(*deadline, fut).await {
                    Ok(result) => result.map_err(Into::into),
                    Err(_) => Err(Error::Timeout { op }),
                }
            }
        }
    }
}

/// Serde adapter: `Option<Duration>` as fractional seconds.
mod duration_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_operation_is_the_default_selection() {
        let opts = TimeoutOptions::new().read(Duration::from_secs(123));
        let policy = TimeoutPolicy::from_name("per_operation", &opts).unwrap();
        assert_eq!(
            policy,
            TimeoutPolicy::PerOperation {
                connect: None,
                read: Some(Duration::from_secs(123)),
                write: None,
            }
        );
    }

    #[test]
    fn global_sums_operation_budgets() {
        let opts = TimeoutOptions::new()
            .connect(Duration::from_secs(2))
            .read(Duration::from_secs(3));
        let policy = TimeoutPolicy::from_name("global", &opts).unwrap();
        assert_eq!(policy, TimeoutPolicy::Global(Duration::from_secs(5)));
    }

    #[test]
    fn global_without_durations_is_rejected() {
        let err = TimeoutPolicy::global(&TimeoutOptions::new()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_policy_names_the_identifier() {
        let err = TimeoutPolicy::from_name("foobar", &TimeoutOptions::new()).unwrap_err();
        assert!(err.to_string().contains("foobar"));
    }

    #[tokio::test]
    async fn per_operation_read_budget_expires() {
        let policy = TimeoutPolicy::per_operation(
            &TimeoutOptions::new().read(Duration::from_millis(10)),
        );
        let guard = policy.start();
        let err = guard
            .run(TimeoutOp::Read, std::future::pending::<std::io::Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { op: TimeoutOp::Read }));
    }

    #[tokio::test]
    async fn per_operation_unbudgeted_op_passes_through() {
        let policy = TimeoutPolicy::per_operation(
            &TimeoutOptions::new().read(Duration::from_millis(10)),
        );
        let guard = policy.start();
        // Write has no budget configured; the future runs to completion.
        let value = guard
            .run(TimeoutOp::Write, async { Ok::<_, std::io::Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn global_deadline_fails_without_io_once_expired() {
        let guard = TimeoutGuard::Global {
            deadline: Instant::now() - Duration::from_millis(1),
        };
        // The future would succeed instantly; the expired deadline wins.
        let err = guard
            .run(TimeoutOp::Write, async { Ok::<_, std::io::Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { op: TimeoutOp::Write }));
    }

    #[tokio::test]
    async fn global_deadline_spans_operations() {
        let policy = TimeoutPolicy::Global(Duration::from_millis(40));
        let guard = policy.start();
        guard
            .run(TimeoutOp::Connect, async { Ok::<_, std::io::Error>(()) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = guard
            .run(TimeoutOp::Read, std::future::pending::<std::io::Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { op: TimeoutOp::Read }));
    }

    #[tokio::test]
    async fn null_policy_never_expires() {
        let guard = TimeoutPolicy::Null.start();
        let value = guard
            .run(TimeoutOp::Read, async { Ok::<_, std::io::Error>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
}
