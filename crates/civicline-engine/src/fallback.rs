//! Fallback Coordinator.
//!
//! A failed delivery gets exactly one more attempt, on the next channel of
//! the user's fallback order (or the system default order), with the
//! response re-rendered for that channel. A transient failure is retried
//! silently; a permanent one is retried with a notice naming the failed
//! channel. No third attempt is ever made.

use civicline_core::{ChannelKind, DeliveryError, DeliveryStatus, LanguageCode};
use tracing::{info, warn};

use crate::channel::ChannelRegistry;
use crate::composer::{failure_notice, OutboundResponse, ResponseBody, ResponseComposer};

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt {
    pub channel: ChannelKind,
    pub error: Option<DeliveryError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    /// The response as last rendered (the delivered one on success).
    pub response: OutboundResponse,
    pub attempts: Vec<DeliveryAttempt>,
}

pub struct FallbackCoordinator {
    channels: ChannelRegistry,
    default_order: Vec<ChannelKind>,
}

impl FallbackCoordinator {
    pub fn new(channels: ChannelRegistry, default_order: Vec<ChannelKind>) -> Self {
        Self {
            channels,
            default_order,
        }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Next registered channel after `current` in the effective order.
    pub fn next_channel(&self, user_order: &[ChannelKind], current: ChannelKind) -> Option<ChannelKind> {
        let order = if user_order.is_empty() {
            &self.default_order
        } else {
            user_order
        };
        let start = order
            .iter()
            .position(|k| *k == current)
            .map_or(0, |idx| idx + 1);
        order[start..]
            .iter()
            .copied()
            .find(|k| *k != current && self.channels.contains(*k))
    }

    async fn attempt(&self, recipient: &str, response: &OutboundResponse) -> Result<(), DeliveryError> {
        let Some(adapter) = self.channels.get(response.channel) else {
            return Err(DeliveryError::Transient(format!(
                "no adapter registered for {}",
                response.channel
            )));
        };
        adapter.deliver(recipient, &response.payload()).await.map(|_| ())
    }

    /// Deliver `initial`, falling back once if needed.
    pub async fn deliver(
        &self,
        composer: &ResponseComposer,
        body: &ResponseBody,
        language: &LanguageCode,
        recipient: &str,
        user_order: &[ChannelKind],
        initial: OutboundResponse,
    ) -> DeliveryOutcome {
        let first_channel = initial.channel;
        let error = match self.attempt(recipient, &initial).await {
            Ok(()) => {
                return DeliveryOutcome {
                    status: DeliveryStatus::Delivered {
                        channel: first_channel,
                    },
                    response: initial,
                    attempts: vec![DeliveryAttempt {
                        channel: first_channel,
                        error: None,
                    }],
                };
            }
            Err(e) => e,
        };

        let mut attempts = vec![DeliveryAttempt {
            channel: first_channel,
            error: Some(error.clone()),
        }];

        let Some(next) = self.next_channel(user_order, first_channel) else {
            warn!(
                component = "fallback",
                channel = %first_channel,
                error = %error,
                "Fallback event: no channel left, delivery failed"
            );
            return DeliveryOutcome {
                status: DeliveryStatus::DeliveryFailed {
                    attempted: vec![first_channel],
                },
                response: initial,
                attempts,
            };
        };

        warn!(
            component = "fallback",
            from = %first_channel,
            to = %next,
            error = %error,
            "Fallback event: re-rendering for next channel"
        );

        let Some(adapter) = self.channels.get(next) else {
            return DeliveryOutcome {
                status: DeliveryStatus::DeliveryFailed {
                    attempted: vec![first_channel],
                },
                response: initial,
                attempts,
            };
        };
        let caps = adapter.capabilities().clone();
        let notice = match &error {
            DeliveryError::Permanent(_) => Some(failure_notice(language, first_channel)),
            DeliveryError::Transient(_) => None,
        };
        let rerendered = composer
            .compose_with_notice(body, language, next, &caps, notice.as_deref())
            .await;

        let second = self.attempt(recipient, &rerendered).await;
        attempts.push(DeliveryAttempt {
            channel: next,
            error: second.as_ref().err().cloned(),
        });

        match second {
            Ok(()) => {
                info!(from = %first_channel, to = %next, "Delivered on fallback channel");
                DeliveryOutcome {
                    status: DeliveryStatus::FellBack {
                        from: first_channel,
                        to: next,
                    },
                    response: rerendered,
                    attempts,
                }
            }
            Err(e) => {
                warn!(
                    component = "fallback",
                    channel = %next,
                    error = %e,
                    "Fallback event: retry failed, delivery failed"
                );
                DeliveryOutcome {
                    status: DeliveryStatus::DeliveryFailed {
                        attempted: vec![first_channel, next],
                    },
                    response: rerendered,
                    attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::ScriptedGateway;
    use crate::composer::tests::EchoSpeech;
    use crate::composer::GREETING_PROMPT;
    use crate::language::tests::PrefixTranslator;
    use crate::language::LanguageStateTracker;
    use crate::translation::TranslationCache;
    use civicline_core::config::{ChannelsConfig, ComposerConfig};
    use civicline_core::LanguageRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    fn composer() -> ResponseComposer {
        let tracker = Arc::new(LanguageStateTracker::new(
            Arc::new(LanguageRegistry::default()),
            Arc::new(TranslationCache::new(Duration::from_secs(60), 100)),
            Arc::new(PrefixTranslator::new()),
            0.6,
            Duration::from_millis(100),
        ));
        ResponseComposer::new(
            tracker,
            Arc::new(EchoSpeech { fail: false }),
            ComposerConfig::default(),
            Duration::from_millis(100),
        )
    }

    fn coordinator(gateway: Arc<ScriptedGateway>) -> FallbackCoordinator {
        let config = ChannelsConfig::default();
        FallbackCoordinator::new(
            ChannelRegistry::standard(&config, gateway, 2000),
            config.default_fallback_order.clone(),
        )
    }

    async fn run(
        gateway: Arc<ScriptedGateway>,
        user_order: &[ChannelKind],
        channel: ChannelKind,
    ) -> DeliveryOutcome {
        let c = composer();
        let coord = coordinator(gateway);
        let body = ResponseBody::Prompt(GREETING_PROMPT.to_string());
        let en = LanguageCode::new("en");
        let caps = coord.channels().get(channel).unwrap().capabilities().clone();
        let initial = c.compose(&body, &en, channel, &caps).await;
        coord.deliver(&c, &body, &en, "+91", user_order, initial).await
    }

    #[test]
    fn test_next_channel_default_order() {
        let coord = coordinator(Arc::new(ScriptedGateway::default()));
        assert_eq!(
            coord.next_channel(&[], ChannelKind::InteractiveWeb),
            Some(ChannelKind::RichMessaging)
        );
        assert_eq!(
            coord.next_channel(&[], ChannelKind::RichMessaging),
            Some(ChannelKind::ShortText)
        );
        assert_eq!(coord.next_channel(&[], ChannelKind::ShortText), None);
        // Not in the order: start from the top.
        assert_eq!(
            coord.next_channel(&[], ChannelKind::Voice),
            Some(ChannelKind::InteractiveWeb)
        );
    }

    #[test]
    fn test_next_channel_user_order() {
        let coord = coordinator(Arc::new(ScriptedGateway::default()));
        let order = [ChannelKind::InteractiveWeb, ChannelKind::ShortText];
        assert_eq!(
            coord.next_channel(&order, ChannelKind::InteractiveWeb),
            Some(ChannelKind::ShortText)
        );
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let gateway = Arc::new(ScriptedGateway::default());
        let outcome = run(gateway.clone(), &[], ChannelKind::InteractiveWeb).await;
        assert_eq!(
            outcome.status,
            DeliveryStatus::Delivered {
                channel: ChannelKind::InteractiveWeb
            }
        );
        assert_eq!(gateway.attempts(), vec![ChannelKind::InteractiveWeb]);
    }

    #[tokio::test]
    async fn test_transient_then_success_falls_back() {
        let gateway = Arc::new(ScriptedGateway::with_outcomes(vec![Err(
            DeliveryError::Transient("503".into()),
        )]));
        let outcome = run(gateway.clone(), &[], ChannelKind::InteractiveWeb).await;
        assert_eq!(
            outcome.status,
            DeliveryStatus::FellBack {
                from: ChannelKind::InteractiveWeb,
                to: ChannelKind::RichMessaging
            }
        );
        assert_eq!(outcome.response.channel, ChannelKind::RichMessaging);
        assert_eq!(
            gateway.attempts(),
            vec![ChannelKind::InteractiveWeb, ChannelKind::RichMessaging]
        );
    }

    #[tokio::test]
    async fn test_two_failures_no_third_attempt() {
        let gateway = Arc::new(ScriptedGateway::with_outcomes(vec![
            Err(DeliveryError::Transient("503".into())),
            Err(DeliveryError::Transient("503".into())),
            Ok(()),
        ]));
        let outcome = run(gateway.clone(), &[], ChannelKind::InteractiveWeb).await;
        assert_eq!(
            outcome.status,
            DeliveryStatus::DeliveryFailed {
                attempted: vec![ChannelKind::InteractiveWeb, ChannelKind::RichMessaging]
            }
        );
        assert_eq!(gateway.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_surfaced_with_notice() {
        let gateway = Arc::new(ScriptedGateway::with_outcomes(vec![Err(
            DeliveryError::Permanent("number blocked".into()),
        )]));
        let outcome = run(gateway.clone(), &[], ChannelKind::RichMessaging).await;
        assert_eq!(
            outcome.status,
            DeliveryStatus::FellBack {
                from: ChannelKind::RichMessaging,
                to: ChannelKind::ShortText
            }
        );
        let sent = gateway.sent.lock().unwrap();
        assert!(sent[1].2.text.starts_with("We could not reach you on the messaging app."));
        assert!(sent[1].2.text.len() <= 160);
    }

    #[tokio::test]
    async fn test_last_channel_failure_has_nowhere_to_go() {
        let gateway = Arc::new(ScriptedGateway::with_outcomes(vec![Err(
            DeliveryError::Transient("timeout".into()),
        )]));
        let outcome = run(gateway.clone(), &[], ChannelKind::ShortText).await;
        assert_eq!(
            outcome.status,
            DeliveryStatus::DeliveryFailed {
                attempted: vec![ChannelKind::ShortText]
            }
        );
        assert_eq!(gateway.attempts().len(), 1);
    }
}
