//! Notification Limiter (spec §4.F): rate-limits out-of-band "challenge pending"
//! messages to at most one per 24h per user, riding on the Challenge Coordinator's
//! `last_notified_at` inheritance across row replacement (spec §4.D, §8 property 2, 6).

// self
use crate::{_prelude::*, auth::UserId, challenge::ChallengeCoordinator, error::ChallengeKind};

const NOTIFICATION_FLOOR: Duration = Duration::hours(24);

/// Sends a plain-HTML message to a user via the out-of-band chat-bot channel (spec §6:
/// "one outbound endpoint: send message by user id with plain HTML text"). Implementors
/// must never propagate send failures as errors — the limiter treats a `false` return the
/// same as any other best-effort failure and moves on (spec §4.F).
pub trait NotificationSender
where
	Self: Send + Sync,
{
	/// Sends `message` to `user`, returning whether the send succeeded.
	fn send<'a>(&'a self, user: UserId, message: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// No-op sender for tests and offline development; records every call it received instead
/// of performing network I/O.
#[derive(Default)]
pub struct NoopNotificationSender {
	sent: Mutex<Vec<(UserId, String)>>,
}
impl NoopNotificationSender {
	/// Returns every `(user, message)` pair passed to [`NotificationSender::send`] so far.
	pub fn sent(&self) -> Vec<(UserId, String)> {
		self.sent.lock().clone()
	}
}
impl NotificationSender for NoopNotificationSender {
	fn send<'a>(&'a self, user: UserId, message: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
		Box::pin(async move {
			self.sent.lock().push((user, message.to_owned()));

			true
		})
	}
}

/// Reqwest-backed sender for a Telegram-Bot-API-shaped chat-bot HTTP surface: `POST
/// {api_base}/bot{token}/sendMessage` with a JSON `{chat_id, text, parse_mode: "HTML"}`
/// body, grounded in `original_source/backend/telegram_notifications/notifications.py`.
#[cfg(feature = "reqwest")]
pub struct ReqwestNotificationSender {
	client: ReqwestClient,
	bot_token: crate::auth::Secret,
	api_base: Url,
}
#[cfg(feature = "reqwest")]
impl ReqwestNotificationSender {
	const DEFAULT_API_BASE: &'static str = "https://api.telegram.org";

	/// Builds a sender against the default chat-bot API base.
	pub fn new(client: ReqwestClient, bot_token: impl Into<String>) -> Self {
		Self::with_api_base(
			client,
			bot_token,
			Url::parse(Self::DEFAULT_API_BASE).expect("default API base is a valid URL"),
		)
	}

	/// Builds a sender against an explicit API base (tests point this at a mock server).
	pub fn with_api_base(client: ReqwestClient, bot_token: impl Into<String>, api_base: Url) -> Self {
		Self { client, bot_token: crate::auth::Secret::new(bot_token.into()), api_base }
	}
}
#[cfg(feature = "reqwest")]
impl NotificationSender for ReqwestNotificationSender {
	fn send<'a>(&'a self, user: UserId, message: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
		Box::pin(async move {
			let Ok(url) = self.api_base.join(&format!("bot{}/sendMessage", self.bot_token.expose())) else {
				return false;
			};
			let body = serde_json::json!({
				"chat_id": user.get(),
				"text": message,
				"parse_mode": "HTML",
			});

			self.client.post(url).json(&body).send().await.is_ok_and(|response| response.status().is_success())
		})
	}
}

/// Builds the fixed "a second factor is required" notification text for a challenge kind.
pub fn challenge_message(kind: ChallengeKind) -> String {
	match kind {
		ChallengeKind::Totp =>
			"🔐 <b>Two-factor authentication required</b>\n\nOpen the app and enter the 6-digit code \
			 from your authenticator to continue marking attendance."
				.to_owned(),
		ChallengeKind::EmailCode =>
			"📧 <b>A one-time code was emailed to you</b>\n\nOpen the app and enter the code to continue."
				.to_owned(),
	}
}

/// Builds the mass-marking success notification text (spec §4.H.4), sent only when a
/// `discipline` is known.
pub fn marking_success_message(discipline: &str) -> String {
	format!("✅ You were marked present\n\n<b>{discipline}</b>")
}

/// Rate-limits second-factor notifications to at most one per 24h per user (spec §4.F,
/// §8 property 6), consulting and updating the user's [`crate::challenge::PendingChallenge`]
/// row through the [`ChallengeCoordinator`] so the floor survives row replacement.
pub struct NotificationLimiter {
	coordinator: Arc<ChallengeCoordinator>,
	sender: Arc<dyn NotificationSender>,
}
impl NotificationLimiter {
	/// Wraps a coordinator and a sender.
	pub fn new(coordinator: Arc<ChallengeCoordinator>, sender: Arc<dyn NotificationSender>) -> Self {
		Self { coordinator, sender }
	}

	/// Sends the `kind` challenge notification to `user` if, and only if, their current
	/// PendingChallenge row's `last_notified_at` is absent or at least 24h old. Returns
	/// whether a notification was actually sent.
	pub async fn maybe_notify(&self, user: UserId, kind: ChallengeKind, now: OffsetDateTime) -> Result<bool> {
		let Some(challenge) = self.coordinator.get(user, now).await? else {
			return Ok(false);
		};
		let due = challenge.last_notified_at.is_none_or(|last| now - last >= NOTIFICATION_FLOOR);

		if !due {
			return Ok(false);
		}
		if !self.sender.send(user, &challenge_message(kind)).await {
			return Ok(false);
		}

		self.coordinator.mark_notified(user, now).await
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		error::{ChallengeOrigin, CredentialOption},
		store::{MemoryStore, SessionCookies},
	};

	fn limiter() -> (NotificationLimiter, Arc<ChallengeCoordinator>, Arc<NoopNotificationSender>) {
		let coordinator = Arc::new(ChallengeCoordinator::new(Arc::new(MemoryStore::default())));
		let sender = Arc::new(NoopNotificationSender::default());
		let limiter = NotificationLimiter::new(coordinator.clone(), sender.clone());

		(limiter, coordinator, sender)
	}

	async fn put_challenge(coordinator: &ChallengeCoordinator, user: UserId, now: OffsetDateTime) {
		coordinator
			.put(
				user,
				ChallengeKind::Totp,
				ChallengeOrigin::Refresh,
				SessionCookies::default(),
				Url::parse("https://sso.example.test/otp").unwrap(),
				None,
				Vec::<CredentialOption>::new(),
				"ua".into(),
				now,
			)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn no_notification_without_a_pending_challenge() {
		let (limiter, _coordinator, sender) = limiter();
		let sent = limiter.maybe_notify(UserId(1), ChallengeKind::Totp, OffsetDateTime::UNIX_EPOCH).await.unwrap();

		assert!(!sent);
		assert!(sender.sent().is_empty());
	}

	#[tokio::test]
	async fn second_call_within_24h_is_suppressed() {
		let (limiter, coordinator, sender) = limiter();
		let user = UserId(300);
		let t0 = OffsetDateTime::UNIX_EPOCH;

		put_challenge(&coordinator, user, t0).await;

		assert!(limiter.maybe_notify(user, ChallengeKind::Totp, t0).await.unwrap());
		assert!(!limiter.maybe_notify(user, ChallengeKind::Totp, t0 + Duration::minutes(10)).await.unwrap());
		assert_eq!(sender.sent().len(), 1);
	}

	#[tokio::test]
	async fn a_second_notification_fires_after_25_hours() {
		let (limiter, coordinator, sender) = limiter();
		let user = UserId(301);
		let t0 = OffsetDateTime::UNIX_EPOCH;

		put_challenge(&coordinator, user, t0).await;

		assert!(limiter.maybe_notify(user, ChallengeKind::Totp, t0).await.unwrap());
		assert!(limiter.maybe_notify(user, ChallengeKind::Totp, t0 + Duration::hours(25)).await.unwrap());
		assert_eq!(sender.sent().len(), 2);
	}
}
