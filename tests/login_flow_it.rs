#![cfg(feature = "reqwest")]

// crates.io
use httpmock::prelude::*;
// self
use session_broker::{
	_preludet::*,
	auth::UserId,
	broker::{Broker, SubmitCodeOutcome},
	cache::SessionCache,
	challenge::ChallengeCoordinator,
	error::{ChallengeKind, ChallengeOrigin},
	notify::{NoopNotificationSender, NotificationLimiter},
	secret_store::SecretStore,
	store::{BrokerStore, MemoryStore},
	totp::AutoTotpResolver,
	upstream::ReqwestUpstreamClient,
};

const LOGIN_FORM_BODY: &str = r#"<form id="kc-form-login" action="/login-actions/authenticate?session=1" method="post"></form>"#;

fn build_broker(server: &MockServer) -> (Broker<ReqwestUpstreamClient>, Arc<MemoryStore>) {
	let client = ReqwestClient::builder()
		.cookie_store(false)
		.danger_accept_invalid_certs(true)
		.build()
		.expect("Failed to build Reqwest client for login flow test.");
	let login_page_url =
		Url::parse(&server.url("/realms/university/protocol/openid-connect/auth")).expect("mock login page URL");
	let upstream = Arc::new(ReqwestUpstreamClient::with_login_page(client, login_page_url));
	let store_backend = Arc::new(MemoryStore::default());
	let store: Arc<dyn BrokerStore> = store_backend.clone();
	let secrets = Arc::new(SecretStore::new([7u8; 32]));
	let cache = Arc::new(SessionCache::new(store.clone()));
	let coordinator = Arc::new(ChallengeCoordinator::new(store.clone()));
	let notifier =
		Arc::new(NotificationLimiter::new(coordinator.clone(), Arc::new(NoopNotificationSender::default())));
	let resolver = Arc::new(AutoTotpResolver::default());
	let broker = Broker::new(upstream, store, secrets, cache, coordinator, notifier, resolver);

	(broker, store_backend)
}

#[tokio::test]
async fn submit_login_classifies_bad_credentials_and_does_not_persist_a_challenge() {
	let server = MockServer::start_async().await;
	let (broker, store) = build_broker(&server);

	let _entry_mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/realms/university/protocol/openid-connect/auth");
			then.status(200).header("content-type", "text/html").body(LOGIN_FORM_BODY);
		})
		.await;
	let _submit_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/login-actions/authenticate");
			then.status(200).header("content-type", "text/html").body(
				r#"<span class="kc-feedback-text">Invalid username or password.</span>"#,
			);
		})
		.await;

	let user = UserId(1);
	let err = broker
		.submit_login(user, "student", "wrong-password", None, OffsetDateTime::UNIX_EPOCH)
		.await
		.expect_err("bad credentials should be reported as an error");

	assert!(matches!(err, Error::CredentialsInvalid));
	assert!(
		store.get_challenge(user).await.unwrap().is_none(),
		"a rejected credential pair must never leave a pending challenge behind"
	);
}

#[tokio::test]
async fn submit_login_surfaces_a_totp_challenge_and_persists_credentials_optimistically() {
	let server = MockServer::start_async().await;
	let (broker, store) = build_broker(&server);

	let _entry_mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/realms/university/protocol/openid-connect/auth");
			then.status(200).header("content-type", "text/html").body(LOGIN_FORM_BODY);
		})
		.await;
	let _submit_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/login-actions/authenticate");
			then.status(200).header("content-type", "text/html").header("set-cookie", "KC_RESTART=abc; Path=/").body(
				r#"<div id="kc-totp-login-form">
					<script>var settings = {"loginAction":"\/login-actions\/authenticate?session=2"};</script>
				</div>"#,
			);
		})
		.await;

	let user = UserId(2);
	let err = broker
		.submit_login(user, "student", "correct-password", Some("test-agent/1.0".into()), OffsetDateTime::UNIX_EPOCH)
		.await
		.expect_err("a TOTP challenge should be surfaced as an error to the caller");

	match err {
		Error::ChallengeRequired { kind, origin, .. } => {
			assert_eq!(kind, ChallengeKind::Totp);
			assert_eq!(origin, ChallengeOrigin::Login);
		},
		other => panic!("expected ChallengeRequired, got {other:?}"),
	}

	let record = store.get_user(user).await.unwrap().expect("credentials should be persisted even on a challenge");

	assert_eq!(record.login.as_deref(), Some("student"));
	assert!(record.password_ciphertext.is_some());
	assert_eq!(record.user_agent.as_deref(), Some("test-agent/1.0"));

	let challenge = store.get_challenge(user).await.unwrap().expect("a pending challenge row should exist");

	assert_eq!(challenge.kind, ChallengeKind::Totp);
	assert_eq!(challenge.origin, ChallengeOrigin::Login);
}

#[tokio::test]
async fn submit_code_with_a_wrong_code_rotates_the_challenge_without_clearing_it() {
	let server = MockServer::start_async().await;
	let (broker, store) = build_broker(&server);

	let _entry_mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/realms/university/protocol/openid-connect/auth");
			then.status(200).header("content-type", "text/html").body(LOGIN_FORM_BODY);
		})
		.await;
	let _submit_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/login-actions/authenticate");
			then.status(200).header("content-type", "text/html").body(
				r#"<div id="kc-totp-login-form">
					<script>var settings = {"loginAction":"\/login-actions\/authenticate?session=3"};</script>
				</div>"#,
			);
		})
		.await;

	let user = UserId(3);

	broker
		.submit_login(user, "student", "correct-password", None, OffsetDateTime::UNIX_EPOCH)
		.await
		.expect_err("first pass should surface the TOTP challenge");

	let outcome = broker
		.submit_code(user, "000000", OffsetDateTime::UNIX_EPOCH + Duration::seconds(1))
		.await
		.expect("a wrong code should be classified, not propagated as a transport error");

	assert!(matches!(outcome, SubmitCodeOutcome::WrongCode { .. }));
	assert!(
		store.get_challenge(user).await.unwrap().is_some(),
		"the challenge row must survive a wrong-code resubmission"
	);
}
