//! Rule evaluation and enforcement.
//!
//! A violation moves `pending -> resolved` when its side effect lands, or
//! `pending -> failed` when it does not. Failed violations keep
//! `action_taken = false` and can be retried.

pub mod matcher;
pub mod rule_cache;

use std::sync::Arc;

use bson::{oid::ObjectId, DateTime};
use serde::Serialize;
use threadline_config::ModerationSettings;
use threadline_db::models::{
    Message, ModerationAction, ModerationRule, ModerationViolation, ServerBan,
    ServerModerationSettings, ViolationStatus, Warning,
};
use tracing::{debug, info, warn};

pub use matcher::{check_message, is_valid_pattern, pattern_matches, sort_rules};
pub use rule_cache::RuleCache;

use crate::error::{Conflict, InvalidState, ServiceError, ServiceResult};
use crate::events::{EventKind, EventPublisher};
use crate::ledger::MembershipLedger;
use crate::message::MessageService;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct NewRule {
    pub server_id: ObjectId,
    pub name: String,
    pub pattern: String,
    pub action: ModerationAction,
    pub severity: u32,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarningStatus {
    pub count: u64,
    pub max_warnings: u32,
    /// The caller decides what to do past the limit.
    pub exceeded: bool,
}

pub struct ModerationPipeline {
    store: Arc<dyn Store>,
    ledger: Arc<MembershipLedger>,
    messages: Arc<MessageService>,
    publisher: Arc<dyn EventPublisher>,
    cache: RuleCache,
    defaults: ModerationSettings,
}

impl ModerationPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<MembershipLedger>,
        messages: Arc<MessageService>,
        publisher: Arc<dyn EventPublisher>,
        defaults: ModerationSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            messages,
            publisher,
            cache: RuleCache::new(),
            defaults,
        }
    }

    pub async fn create_rule(&self, new: NewRule) -> ServiceResult<ModerationRule> {
        if !is_valid_pattern(&new.pattern) {
            return Err(ServiceError::InvalidState(InvalidState::InvalidRulePattern));
        }
        let now = DateTime::now();
        let rule = ModerationRule {
            id: ObjectId::new(),
            server_id: new.server_id,
            name: new.name,
            pattern: new.pattern,
            action: new.action,
            severity: new.severity,
            duration_secs: new.duration_secs.filter(|secs| *secs > 0),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_rule(&rule).await?;
        self.cache.invalidate(rule.server_id);

        info!(rule_id = ?rule.id, server_id = ?rule.server_id, action = ?rule.action, severity = rule.severity, "Moderation rule created");
        Ok(rule)
    }

    pub async fn set_rule_active(
        &self,
        rule_id: ObjectId,
        active: bool,
    ) -> ServiceResult<ModerationRule> {
        let rule = self.store.set_rule_active(rule_id, active).await?;
        self.cache.invalidate(rule.server_id);
        info!(?rule_id, active, "Moderation rule toggled");
        Ok(rule)
    }

    /// All rules of the server, active or not, in evaluation order.
    pub async fn list_rules(&self, server_id: ObjectId) -> ServiceResult<Vec<ModerationRule>> {
        Ok(self.store.find_rules(server_id, false).await?)
    }

    pub async fn active_rules(
        &self,
        server_id: ObjectId,
    ) -> ServiceResult<Arc<Vec<ModerationRule>>> {
        if let Some(rules) = self.cache.get(server_id) {
            return Ok(rules);
        }
        let mut rules = self.store.find_rules(server_id, true).await?;
        sort_rules(&mut rules);
        debug!(?server_id, count = rules.len(), "Rule cache loaded");
        Ok(self.cache.insert(server_id, rules))
    }

    /// Matches the message against the server's active rules.
    pub async fn evaluate(
        &self,
        server_id: ObjectId,
        message: &Message,
    ) -> ServiceResult<Option<ModerationRule>> {
        let rules = self.active_rules(server_id).await?;
        Ok(check_message(message, &rules).cloned())
    }

    pub async fn record_violation(
        &self,
        rule: &ModerationRule,
        message: &Message,
    ) -> ServiceResult<ModerationViolation> {
        let Some(user_id) = message.author_id else {
            return Err(ServiceError::InvalidState(InvalidState::SystemMessageImmutable));
        };
        let violation = ModerationViolation {
            id: ObjectId::new(),
            server_id: rule.server_id,
            rule_id: rule.id,
            message_id: message.id,
            user_id,
            channel_id: message.channel_id,
            action: rule.action,
            status: ViolationStatus::Pending,
            action_taken: false,
            attempts: 0,
            failure_reason: None,
            created_at: DateTime::now(),
            resolved_at: None,
        };
        self.store.insert_violation(&violation).await?;

        info!(violation_id = ?violation.id, rule_id = ?rule.id, message_id = ?message.id, ?user_id, "Violation recorded");
        Ok(violation)
    }

    /// Applies the violation's action. Already resolved violations come
    /// back untouched.
    pub async fn enforce(&self, violation_id: ObjectId) -> ServiceResult<ModerationViolation> {
        let mut violation = self.store.get_violation(violation_id).await?;
        if violation.status == ViolationStatus::Resolved {
            return Ok(violation);
        }
        violation.attempts += 1;

        match self.apply(&violation).await {
            Ok(()) => {
                violation.status = ViolationStatus::Resolved;
                violation.action_taken = true;
                violation.failure_reason = None;
                violation.resolved_at = Some(DateTime::now());
                self.store.update_violation(&violation).await?;

                info!(?violation_id, action = ?violation.action, attempts = violation.attempts, "Violation enforced");
                self.publisher.publish(
                    violation.channel_id,
                    EventKind::ModerationAction,
                    serde_json::json!({
                        "violation_id": violation.id.to_hex(),
                        "channel_id": violation.channel_id.to_hex(),
                        "message_id": violation.message_id.to_hex(),
                        "user_id": violation.user_id.to_hex(),
                        "action": violation.action,
                    }),
                );
                Ok(violation)
            }
            Err(err) => {
                let reason = err.to_string();
                violation.status = ViolationStatus::Failed;
                violation.action_taken = false;
                violation.failure_reason = Some(reason.clone());
                if let Err(store_err) = self.store.update_violation(&violation).await {
                    warn!(?violation_id, error = %store_err, "Could not record enforcement failure");
                }
                warn!(?violation_id, action = ?violation.action, attempts = violation.attempts, %reason, "Enforcement failed");

                if err.is_transient() {
                    Err(err)
                } else {
                    Err(ServiceError::EnforcementFailed {
                        violation_id,
                        reason,
                    })
                }
            }
        }
    }

    async fn apply(&self, violation: &ModerationViolation) -> ServiceResult<()> {
        let now = DateTime::now();
        match violation.action {
            ModerationAction::Warn => {
                let settings = self.server_settings(violation.server_id).await?;
                let warning = Warning {
                    id: ObjectId::new(),
                    server_id: violation.server_id,
                    user_id: violation.user_id,
                    violation_id: violation.id,
                    created_at: now,
                    expires_at: after(now, settings.warning_expiry_secs),
                };
                match self.store.insert_warning(&warning).await {
                    Ok(()) | Err(StoreError::DuplicateKey(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            ModerationAction::Delete => {
                self.messages.erase_message(violation.message_id).await?;
                Ok(())
            }
            ModerationAction::Mute => {
                let rule = self.store.get_rule(violation.rule_id).await?;
                let secs = match rule.duration_secs {
                    Some(secs) => secs,
                    None => self.server_settings(violation.server_id).await?.default_mute_secs,
                };
                self.ledger
                    .apply_mute(violation.channel_id, violation.user_id, Some(after(now, secs)))
                    .await?;
                Ok(())
            }
            ModerationAction::Ban => {
                if self
                    .ledger
                    .is_owner(violation.channel_id, violation.user_id)
                    .await?
                {
                    return Err(ServiceError::Conflict(Conflict::CannotRemoveOwner));
                }
                let rule = self.store.get_rule(violation.rule_id).await?;
                let ban = ServerBan {
                    id: ObjectId::new(),
                    server_id: violation.server_id,
                    user_id: violation.user_id,
                    violation_id: Some(violation.id),
                    expires_at: rule
                        .duration_secs
                        .or(self.defaults.default_ban_secs)
                        .map(|secs| after(now, secs)),
                    created_at: now,
                };
                match self.store.insert_ban(&ban).await {
                    Ok(()) | Err(StoreError::DuplicateKey(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                match self
                    .ledger
                    .expel_member(violation.channel_id, violation.user_id)
                    .await
                {
                    Ok(()) | Err(ServiceError::NotAMember) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Re-enforces every failed violation of the server. Returns the
    /// violations as they stand afterwards.
    pub async fn retry_failed(
        &self,
        server_id: ObjectId,
    ) -> ServiceResult<Vec<ModerationViolation>> {
        let failed = self
            .store
            .find_violations(server_id, Some(ViolationStatus::Failed))
            .await?;

        let mut results = Vec::with_capacity(failed.len());
        for violation in failed {
            match self.enforce(violation.id).await {
                Ok(resolved) => results.push(resolved),
                Err(ServiceError::EnforcementFailed { violation_id, .. }) => {
                    results.push(self.store.get_violation(violation_id).await?);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    pub async fn list_violations(
        &self,
        server_id: ObjectId,
        status: Option<ViolationStatus>,
    ) -> ServiceResult<Vec<ModerationViolation>> {
        Ok(self.store.find_violations(server_id, status).await?)
    }

    /// Unexpired warnings for the user in the server.
    pub async fn get_warning_count(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<u64> {
        Ok(self
            .store
            .count_active_warnings(server_id, user_id, DateTime::now())
            .await?)
    }

    pub async fn warning_status(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<WarningStatus> {
        let count = self.get_warning_count(server_id, user_id).await?;
        let max_warnings = self.server_settings(server_id).await?.max_warnings;
        Ok(WarningStatus {
            count,
            max_warnings,
            exceeded: count > u64::from(max_warnings),
        })
    }

    /// Stored per-server settings, or the configured defaults.
    pub async fn server_settings(
        &self,
        server_id: ObjectId,
    ) -> ServiceResult<ServerModerationSettings> {
        let stored = self.store.get_server_settings(server_id).await?;
        Ok(stored.unwrap_or_else(|| ServerModerationSettings {
            server_id,
            max_warnings: self.defaults.max_warnings,
            warning_expiry_secs: self.defaults.warning_expiry_secs,
            default_mute_secs: self.defaults.default_mute_secs,
            updated_at: DateTime::now(),
        }))
    }

    pub async fn set_server_settings(
        &self,
        mut settings: ServerModerationSettings,
    ) -> ServiceResult<ServerModerationSettings> {
        settings.updated_at = DateTime::now();
        self.store.put_server_settings(&settings).await?;
        info!(server_id = ?settings.server_id, max_warnings = settings.max_warnings, "Moderation settings updated");
        Ok(settings)
    }
}

fn after(now: DateTime, secs: i64) -> DateTime {
    DateTime::from_millis(now.timestamp_millis().saturating_add(secs.saturating_mul(1000)))
}
