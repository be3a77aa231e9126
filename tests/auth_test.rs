mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{MockFod, MockState};
use fodcli::{
    Error, Result,
    fod::{Connection, CredentialSource, ReleaseApi, TokenManager},
    types::{Credentials, Token},
};

// Credential source that counts refreshes and takes a while to answer
struct CountingSource {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingSource {
    async fn fetch_token(&self) -> Result<Token> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(Token::new(format!("counted-{n}"), 3600))
    }
}

struct FailingSource;

#[async_trait]
impl CredentialSource for FailingSource {
    async fn fetch_token(&self) -> Result<Token> {
        Err(Error::Authentication("invalid_client".into()))
    }
}

fn expired_token() -> Token {
    Token {
        access_token: "stale".into(),
        expires_in: 3600,
        obtained_at: 0,
    }
}

#[test]
fn test_token_expiry_margin() {
    let fresh = Token::new("fresh", 3600);
    assert!(!fresh.is_expired());

    // inside the 240 second margin
    let now = chrono::Utc::now().timestamp() as u64;
    let nearly = Token {
        access_token: "nearly".into(),
        expires_in: 3600,
        obtained_at: now - 3600 + 100,
    };
    assert!(nearly.is_expired());

    assert!(expired_token().is_expired());
}

#[test]
fn test_credentials_from_user() {
    let key = Credentials::from_user_password("client-id", "secret");
    assert_eq!(
        key,
        Credentials::ClientCredentials {
            client_id: "client-id".into(),
            client_secret: "secret".into(),
        }
    );

    let user = Credentials::from_user_password("acme\\jane", "pw");
    assert_eq!(
        user,
        Credentials::Password {
            tenant: "acme".into(),
            username: "jane".into(),
            password: "pw".into(),
        }
    );
    assert_eq!(user.principal(), "acme\\jane");

    // secrets never show up in debug output
    assert!(!format!("{key:?}").contains("secret"));
    assert!(!format!("{user:?}").contains("pw"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_is_single_flight() {
    let source = CountingSource::new(Duration::from_millis(50));
    let tokens = TokenManager::with_token(source.clone(), expired_token());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let tokens = tokens.clone();
        handles.push(tokio::spawn(async move { tokens.get_token().await }));
    }

    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap().unwrap().access_token);
    }

    assert_eq!(source.calls(), 1);
    assert!(seen.iter().all(|t| t == "counted-1"));
}

#[tokio::test]
async fn test_valid_token_is_reused() {
    let source = CountingSource::new(Duration::ZERO);
    let tokens = TokenManager::new(source.clone());

    let first = tokens.get_token().await.unwrap();
    let second = tokens.get_token().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_invalidate_only_drops_matching_token() {
    let source = CountingSource::new(Duration::ZERO);
    let tokens = TokenManager::new(source.clone());

    let first = tokens.get_token().await.unwrap();
    tokens.invalidate(&first).await;
    let second = tokens.get_token().await.unwrap();
    assert_ne!(first, second);

    // a late invalidation of the old token keeps the new one
    tokens.invalidate(&first).await;
    assert_eq!(tokens.current_token().await, Some(second));
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_failed_refresh_leaves_slot_empty() {
    let tokens = TokenManager::with_token(Arc::new(FailingSource), expired_token());
    assert!(tokens.current_token().await.is_some());

    let result = tokens.get_token().await;
    assert!(matches!(result, Err(Error::Authentication(_))));
    assert!(tokens.current_token().await.is_none());

    let again = tokens.get_token().await;
    assert!(matches!(again, Err(Error::Authentication(_))));
}

#[tokio::test]
async fn test_client_credentials_grant() {
    let fod = MockFod::start().await;
    fod.connect().await;

    let forms = fod.state.token_forms.lock().unwrap().clone();
    assert_eq!(forms.len(), 1);
    let form = &forms[0];
    assert_eq!(form["grant_type"], "client_credentials");
    assert_eq!(form["scope"], "api-tenant");
    assert_eq!(form["client_id"], "client-id");
    assert_eq!(form["client_secret"], "client-secret");
}

#[tokio::test]
async fn test_password_grant() {
    let fod = MockFod::start().await;
    Connection::builder()
        .connection_string(format!("http://acme%5Cjane:p%40ss@{}/", fod.addr))
        .build()
        .await
        .unwrap();

    let forms = fod.state.token_forms.lock().unwrap().clone();
    let form = &forms[0];
    assert_eq!(form["grant_type"], "password");
    assert_eq!(form["username"], "acme\\jane");
    assert_eq!(form["password"], "p@ss");
}

#[tokio::test]
async fn test_rejected_credentials_fail_connect() {
    let fod = MockFod::start().await;
    let result = Connection::builder()
        .connection_string(format!("http://client-id:wrong@{}/", fod.addr))
        .build()
        .await;

    assert!(matches!(result, Err(Error::Authentication(_))));
}

#[tokio::test]
async fn test_unauthorized_triggers_single_reauthentication() {
    let fod = MockFod::start().await;
    let conn = fod.connect().await;
    assert_eq!(MockState::count(&fod.state.token_requests), 1);

    // the server revokes the current token
    fod.state
        .rejected_tokens
        .lock()
        .unwrap()
        .push("token-1".into());

    let results = conn
        .api::<ReleaseApi>()
        .query_releases()
        .build()
        .get_all()
        .await
        .unwrap();

    assert_eq!(results.len(), 7);
    assert_eq!(MockState::count(&fod.state.token_requests), 2);
    assert_eq!(
        conn.tokens().current_token().await.map(|t| t.access_token),
        Some("token-2".to_string())
    );
}

#[tokio::test]
async fn test_repeated_unauthorized_is_authentication_error() {
    let fod = MockFod::start().await;
    let conn = fod.connect().await;
    fod.state.reject_all_tokens.store(true, Ordering::SeqCst);

    let result = conn.api::<ReleaseApi>().query_releases().build().get_all().await;

    assert!(matches!(result, Err(Error::Authentication(_))));
    assert_eq!(MockState::count(&fod.state.token_requests), 2);
}

#[tokio::test]
async fn test_custom_credential_source() {
    let fod = MockFod::start().await;
    let source = CountingSource::new(Duration::ZERO);
    let conn = Connection::builder()
        .base_url(format!("http://{}", fod.addr))
        .credential_source(source.clone())
        .build()
        .await
        .unwrap();

    let results = conn
        .api::<ReleaseApi>()
        .query_releases()
        .application_name("JuiceShop")
        .build()
        .get_all()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(source.calls(), 1);
    assert_eq!(MockState::count(&fod.state.token_requests), 0);
}
