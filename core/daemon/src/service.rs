//! Bifrost: the daemon's service object.
//!
//! Owns the registry, the cache, the notification policy and the outbound
//! queue; the server layer is a thin dispatcher over it. Constructed
//! explicitly in `main` (and in tests with fakes) rather than living in a
//! global.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use heimdall_core::cache::{CacheError, CacheKey, CommandCache};
use heimdall_core::config::Config;
use heimdall_core::executor::{CommandExecutor, ExecutionRecord};
use heimdall_core::notify::{spawn_drain, Notifier, NotifyQueue};
use heimdall_core::policy::{self, CommandOutcome, PolicySettings};
use heimdall_core::registry::{CommandRegistry, RunningCommand, WaitOutcome};

use heimdall_daemon_protocol::{
    CacheCommandParams, CommandEndParams, CommandStartParams,
};

pub struct Bifrost {
    registry: CommandRegistry,
    cache: CommandCache,
    policy: PolicySettings,
    queue: NotifyQueue,
}

impl Bifrost {
    pub fn new(
        config: &Config,
        executor: Arc<dyn CommandExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry: CommandRegistry::new(),
            cache: CommandCache::new(executor, config.ttl_floor()),
            policy: PolicySettings {
                always_notify: config.commands.always_notify.clone(),
                never_notify: config.commands.never_notify.clone(),
                quiet_period: config.quiet_period(),
            },
            queue: spawn_drain(notifier),
        }
    }

    pub fn command_start(&self, params: &CommandStartParams) -> String {
        self.registry.start(
            &params.command,
            params.id.as_deref(),
            params.start_time.and_then(epoch_secs),
        )
    }

    /// Closes the entry (releasing waiters) and kicks off the notification
    /// decision on a detached thread so the RPC returns promptly.
    pub fn command_end(&self, params: &CommandEndParams) {
        let ended = self.registry.end(&params.id);

        // Prefer what the registry knew; fall back to the request's own
        // command/start-time so a daemon restart mid-command still notifies.
        let (command, start_time) = match ended {
            Some(RunningCommand {
                command,
                start_time,
                ..
            }) => (command, start_time),
            None => {
                tracing::debug!(id = %params.id, "End for unknown id");
                match (&params.command, params.start_time.and_then(epoch_secs)) {
                    (Some(command), Some(start_time)) => (command.clone(), start_time),
                    _ => return,
                }
            }
        };

        let outcome = CommandOutcome {
            command,
            start_time,
            end_time: Utc::now(),
            last_interaction: params.last_interaction_time.and_then(epoch_secs),
            return_code: params.return_code,
            force_notify: params.force_notify,
        };
        let settings = self.policy.clone();
        let queue = self.queue.clone();
        let spawned = thread::Builder::new()
            .name("notify-decision".to_string())
            .spawn(move || {
                if let Some(message) = policy::evaluate(&settings, &outcome) {
                    tracing::info!(command = %outcome.command, "Notifying");
                    queue.push(message);
                }
            });
        if let Err(err) = spawned {
            tracing::error!(error = %err, "Failed to spawn notification decision");
        }
    }

    pub fn list_commands(&self) -> Vec<RunningCommand> {
        self.registry.list()
    }

    pub fn wait_for_command(&self, id: &str, cancelled: &mut dyn FnMut() -> bool) -> WaitOutcome {
        self.registry.wait_for(id, cancelled)
    }

    pub fn cache_command(
        &self,
        params: &CacheCommandParams,
        cancelled: &mut dyn FnMut() -> bool,
    ) -> Result<ExecutionRecord, CacheError> {
        let key = CacheKey {
            program: params.command.clone(),
            args: params.args.clone(),
        };
        self.cache.get(
            &key,
            Duration::from_secs(u64::from(params.within_secs)),
            params.any,
            cancelled,
        )
    }

    /// Direct send, bypassing the policy (the `heimdall notify` subcommand).
    pub fn notify(&self, message: String) {
        self.queue.push(message);
    }
}

fn epoch_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
