use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use ticketpal::auth::{jwt::JwtService, password::hash_password};
use ticketpal::automation::browser::{BrowserProvider, DriverError, PageDriver};
use ticketpal::automation::remote::{LearnJobRequest, RemoteJobClient, RemoteJobError, RunJobRequest};
use ticketpal::automation::text_gen::{ChallengeTextRequest, TextGenerationError, TextGenerator};
use ticketpal::automation::webhook::{apply_webhook, AutomationWebhook, RunResult, WebhookAck};
use ticketpal::automation::AutomationServices;
use ticketpal::config::{AppConfig, RecipeExecution};
use ticketpal::db::{self, PgPool, MIGRATIONS};
use ticketpal::models::{
    Challenge, IssuerAutomation, Job, Media, NewTicket, NewUser, NewVehicle,
};
use ticketpal::routes;
use ticketpal::state::AppState;
use ticketpal::storage::ObjectStorage;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }

    #[allow(dead_code)]
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// What a scripted portal page shows: element texts by selector, and the URL
/// a click on a selector leads to.
#[derive(Clone, Default)]
pub struct PortalScript {
    pub elements: HashMap<String, Vec<String>>,
    pub placeholders: HashMap<String, String>,
    pub navigations: HashMap<String, String>,
}

impl PortalScript {
    #[allow(dead_code)]
    pub fn element(mut self, selector: &str, texts: &[&str]) -> Self {
        self.elements.insert(
            selector.to_string(),
            texts.iter().map(|text| text.to_string()).collect(),
        );
        self
    }

    #[allow(dead_code)]
    pub fn placeholder(mut self, selector: &str, text: &str) -> Self {
        self.placeholders.insert(selector.to_string(), text.to_string());
        self
    }

    #[allow(dead_code)]
    pub fn navigates(mut self, selector: &str, url: &str) -> Self {
        self.navigations.insert(selector.to_string(), url.to_string());
        self
    }
}

pub struct ScriptedPage {
    script: PortalScript,
    url: StdMutex<String>,
    actions: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedPage {
    fn present(&self, selector: &str) -> Result<&Vec<String>, DriverError> {
        self.script
            .elements
            .get(selector)
            .ok_or_else(|| DriverError::selector_not_found(selector))
    }

    fn record(&self, action: String) {
        if let Ok(mut actions) = self.actions.lock() {
            actions.push(action);
        }
    }
}

#[async_trait]
impl PageDriver for ScriptedPage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.record(format!("goto {url}"));
        *self.url.lock().map_err(|_| DriverError::Protocol("poisoned".into()))? = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self
            .url
            .lock()
            .map_err(|_| DriverError::Protocol("poisoned".into()))?
            .clone())
    }

    async fn exists(&self, selector: &str) -> Result<bool, DriverError> {
        Ok(self.script.elements.contains_key(selector))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        self.present(selector)?;
        self.record(format!("fill {selector}={value}"));
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.present(selector)?;
        self.record(format!("click {selector}"));
        if let Some(url) = self.script.navigations.get(selector) {
            *self.url.lock().map_err(|_| DriverError::Protocol("poisoned".into()))? = url.clone();
        }
        Ok(())
    }

    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), DriverError> {
        let items = self.present(selector)?;
        ensure_index(selector, items, index)?;
        self.record(format!("click {selector}[{index}]"));
        Ok(())
    }

    async fn select_option(&self, selector: &str, option: &str) -> Result<(), DriverError> {
        self.present(selector)?;
        self.record(format!("select {selector}={option}"));
        Ok(())
    }

    async fn set_checked(&self, selector: &str, checked: bool) -> Result<(), DriverError> {
        self.present(selector)?;
        self.record(format!("check {selector}={checked}"));
        Ok(())
    }

    async fn text(&self, selector: &str) -> Result<String, DriverError> {
        Ok(self.present(selector)?.first().cloned().unwrap_or_default())
    }

    async fn value(&self, selector: &str) -> Result<String, DriverError> {
        self.present(selector)?;
        Ok(String::new())
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, DriverError> {
        self.present(selector)?;
        if name == "placeholder" {
            return Ok(self.script.placeholders.get(selector).cloned());
        }
        Ok(None)
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, DriverError> {
        Ok(self.script.elements.get(selector).cloned().unwrap_or_default())
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, DriverError> {
        let url = self.current_url().await?;
        Ok(format!("png:{url}:{full_page}").into_bytes())
    }

    async fn element_screenshots(&self, selector: &str) -> Result<Vec<Vec<u8>>, DriverError> {
        Ok(self
            .script
            .elements
            .get(selector)
            .map(|items| {
                items
                    .iter()
                    .map(|item| format!("png:{selector}:{item}").into_bytes())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ensure_index(selector: &str, items: &[String], index: usize) -> Result<(), DriverError> {
    if index < items.len() {
        Ok(())
    } else {
        Err(DriverError::selector_not_found(selector))
    }
}

/// Opens [`ScriptedPage`]s for the current script, or refuses to launch.
#[derive(Default)]
pub struct FakeBrowser {
    script: StdMutex<PortalScript>,
    fail_launch: StdMutex<bool>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    actions: Arc<StdMutex<Vec<String>>>,
}

#[allow(dead_code)]
impl FakeBrowser {
    pub fn set_script(&self, script: PortalScript) {
        if let Ok(mut guard) = self.script.lock() {
            *guard = script;
        }
    }

    pub fn fail_launch(&self, fail: bool) {
        if let Ok(mut guard) = self.fail_launch.lock() {
            *guard = fail;
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BrowserProvider for FakeBrowser {
    async fn open(&self) -> Result<Box<dyn PageDriver>, DriverError> {
        if self.fail_launch.lock().map(|f| *f).unwrap_or(false) {
            return Err(DriverError::Launch("no chromium in test".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().map(|s| s.clone()).unwrap_or_default();
        Ok(Box::new(ScriptedPage {
            script,
            url: StdMutex::new("about:blank".to_string()),
            actions: self.actions.clone(),
            closed: self.closed.clone(),
        }))
    }
}

#[derive(Default)]
pub struct FakeTextGenerator {
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl FakeTextGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for FakeTextGenerator {
    async fn generate(
        &self,
        request: &ChallengeTextRequest,
    ) -> Result<String, TextGenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("I challenge PCN {} on the grounds given.", request.pcn_number))
    }
}

/// Remote worker double that hands out sequential job ids.
#[derive(Default)]
pub struct FakeRemoteJobs {
    learn_calls: AtomicUsize,
    run_calls: AtomicUsize,
    fail: StdMutex<bool>,
    runs: StdMutex<Vec<RunJobRequest>>,
    report_during_start: StdMutex<Option<PgPool>>,
    acks: StdMutex<Vec<WebhookAck>>,
}

#[allow(dead_code)]
impl FakeRemoteJobs {
    pub fn learn_calls(&self) -> usize {
        self.learn_calls.load(Ordering::SeqCst)
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.learn_calls() + self.run_calls()
    }

    pub fn fail_requests(&self, fail: bool) {
        if let Ok(mut guard) = self.fail.lock() {
            *guard = fail;
        }
    }

    pub fn runs(&self) -> Vec<RunJobRequest> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Delivers a successful run result through `pool` before the start call
    /// returns, the way a fast worker can.
    pub fn report_during_start(&self, pool: PgPool) {
        if let Ok(mut guard) = self.report_during_start.lock() {
            *guard = Some(pool);
        }
    }

    pub fn acks(&self) -> Vec<WebhookAck> {
        self.acks.lock().map(|a| a.clone()).unwrap_or_default()
    }

    async fn report_success(&self, job_id: &str, challenge_id: Uuid) {
        let Some(pool) = self.report_during_start.lock().ok().and_then(|p| p.clone()) else {
            return;
        };
        let webhook = AutomationWebhook::Run {
            job_id: job_id.to_string(),
            challenge_id,
            outcome: RunResult::Succeeded {
                completed_steps: 3,
                screenshots: Vec::new(),
                generated_text: None,
                confirmation_reference: Some("FAST-1".to_string()),
            },
        };
        let ack = tokio::task::spawn_blocking(move || -> Result<WebhookAck> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            Ok(apply_webhook(&mut conn, webhook)?)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|ack| ack)
        .unwrap_or_else(|err| WebhookAck {
            applied: false,
            detail: err.to_string(),
        });
        if let Ok(mut acks) = self.acks.lock() {
            acks.push(ack);
        }
    }

    fn failing(&self) -> bool {
        self.fail.lock().map(|f| *f).unwrap_or(false)
    }
}

#[async_trait]
impl RemoteJobClient for FakeRemoteJobs {
    async fn start_learn_job(&self, _request: &LearnJobRequest) -> Result<String, RemoteJobError> {
        let n = self.learn_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing() {
            return Err(RemoteJobError::Status {
                status: 503,
                body: "worker unavailable".to_string(),
            });
        }
        Ok(format!("learn-{n}"))
    }

    async fn start_run_job(&self, request: &RunJobRequest) -> Result<String, RemoteJobError> {
        let n = self.run_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing() {
            return Err(RemoteJobError::Status {
                status: 503,
                body: "worker unavailable".to_string(),
            });
        }
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(request.clone());
        }
        let job_id = format!("run-{n}");
        self.report_success(&job_id, request.challenge_id).await;
        Ok(job_id)
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    pub storage: Arc<FakeStorage>,
    pub browser: Arc<FakeBrowser>,
    pub text: Arc<FakeTextGenerator>,
    pub remote: Arc<FakeRemoteJobs>,
}

pub fn test_config(database_url: String, recipe_execution: RecipeExecution) -> AppConfig {
    AppConfig {
        database_url,
        database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        jwt_secret: "test-secret".to_string(),
        jwt_issuer: "test-issuer".to_string(),
        jwt_audience: "test-audience".to_string(),
        jwt_expiry_minutes: 60,
        cors_allowed_origin: None,
        aws_endpoint_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "eu-west-2".to_string(),
        s3_bucket: "test-bucket".to_string(),
        openai_api_key: None,
        openai_base_url: "http://127.0.0.1:9".to_string(),
        openai_model: "test-model".to_string(),
        automation_worker_url: Some("http://remote-worker.test".to_string()),
        automation_worker_token: None,
        automation_webhook_url: Some("http://ticketpal.test/api/webhooks/automation".to_string()),
        automation_webhook_secret: Some(TEST_WEBHOOK_SECRET.to_string()),
        recipe_execution,
        browser_headless: true,
        browser_executable: None,
        step_max_attempts: 2,
        step_retry_backoff_ms: 1,
        portal_settle_timeout_secs: 1,
    }
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_execution(RecipeExecution::Remote).await
    }

    pub async fn with_execution(recipe_execution: RecipeExecution) -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;
        let config = test_config(database_url, recipe_execution);

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let browser = Arc::new(FakeBrowser::default());
        let text = Arc::new(FakeTextGenerator::default());
        let remote = Arc::new(FakeRemoteJobs::default());
        let automation = AutomationServices {
            browser: browser.clone(),
            text: text.clone(),
            remote: remote.clone(),
        };
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool, config, storage_for_state, jwt, automation);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
            browser,
            text,
            remote,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(|conn| truncate_all(conn)).await
    }

    pub async fn insert_user(&self, email: &str, password: &str, role: &str) -> Result<Uuid> {
        let email = email.to_string();
        let password = password.to_string();
        let role = role.to_string();
        self.with_conn(move |conn| {
            let user = NewUser {
                id: Uuid::new_v4(),
                email,
                password_hash: hash_password(&password)?,
                role,
                name: Some("Jane Motorist".to_string()),
                address_line1: Some("1 High Street".to_string()),
                city: Some("London".to_string()),
                postcode: Some("SE13 6LG".to_string()),
                ..Default::default()
            };
            diesel::insert_into(ticketpal::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    /// Inserts a vehicle and a ticket for `user_id`, returning the ticket id.
    pub async fn insert_ticket(&self, user_id: Uuid, pcn_number: &str, issuer: &str) -> Result<Uuid> {
        let pcn_number = pcn_number.to_string();
        let issuer = issuer.to_string();
        self.with_conn(move |conn| {
            let vehicle = NewVehicle {
                id: Uuid::new_v4(),
                user_id,
                registration: "ab12 cde".to_string(),
                make: None,
                model: None,
            };
            diesel::insert_into(ticketpal::schema::vehicles::table)
                .values(&vehicle)
                .execute(conn)
                .context("failed to insert vehicle")?;
            let ticket = NewTicket {
                id: Uuid::new_v4(),
                vehicle_id: vehicle.id,
                pcn_number,
                issuer,
                issuer_type: "COUNCIL".to_string(),
                contravention_code: Some("01".to_string()),
                initial_amount: 13000,
                status: "ISSUED".to_string(),
            };
            diesel::insert_into(ticketpal::schema::tickets::table)
                .values(&ticket)
                .execute(conn)
                .context("failed to insert ticket")?;
            Ok(ticket.id)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_automation(
        &self,
        issuer_id: &str,
        issuer_name: &str,
        status: &str,
        steps: Option<serde_json::Value>,
    ) -> Result<()> {
        use ticketpal::schema::issuer_automations::dsl;
        let issuer_id = issuer_id.to_string();
        let issuer_name = issuer_name.to_string();
        let status = status.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(dsl::issuer_automations)
                .values((
                    dsl::id.eq(Uuid::new_v4()),
                    dsl::issuer_id.eq(issuer_id),
                    dsl::issuer_name.eq(issuer_name),
                    dsl::status.eq(status),
                    dsl::steps.eq(steps),
                    dsl::learn_job_id.eq(Some("learn-seeded".to_string())),
                ))
                .execute(conn)
                .context("failed to insert automation")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn automations(&self) -> Result<Vec<IssuerAutomation>> {
        self.with_conn(|conn| {
            use ticketpal::schema::issuer_automations::dsl;
            dsl::issuer_automations
                .load::<IssuerAutomation>(conn)
                .context("failed to load automations")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn challenges(&self, ticket_id: Uuid) -> Result<Vec<Challenge>> {
        self.with_conn(move |conn| {
            use ticketpal::schema::challenges::dsl;
            dsl::challenges
                .filter(dsl::ticket_id.eq(ticket_id))
                .order(dsl::created_at.asc())
                .load::<Challenge>(conn)
                .context("failed to load challenges")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn media(&self, ticket_id: Uuid) -> Result<Vec<Media>> {
        self.with_conn(move |conn| {
            use ticketpal::schema::media::dsl;
            dsl::media
                .filter(dsl::ticket_id.eq(ticket_id))
                .order(dsl::created_at.asc())
                .load::<Media>(conn)
                .context("failed to load media")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn jobs_by_type(&self, ty: &str) -> Result<Vec<Job>> {
        let ty = ty.to_string();
        self.with_conn(move |conn| {
            use ticketpal::schema::jobs::dsl::{created_at, job_type, jobs};
            jobs.filter(job_type.eq(&ty))
                .order(created_at.asc())
                .load::<Job>(conn)
                .context("failed to load jobs")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn set_challenge_created_at(
        &self,
        challenge_id: Uuid,
        created: chrono::NaiveDateTime,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            use ticketpal::schema::challenges::dsl;
            diesel::update(dsl::challenges.find(challenge_id))
                .set(dsl::created_at.eq(created))
                .execute(conn)
                .context("failed to backdate challenge")?;
            Ok(())
        })
        .await
    }

    pub async fn login_token(&self, email: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            email: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json("/api/auth/login", &LoginPayload { email, password }, None)
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = body_to_vec(response.into_body()).await?;
        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = serde_json::from_slice(&body)?;
        Ok(parsed.access_token)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.post_json_with_headers(path, payload, token, &[]).await
    }

    pub async fn post_json_with_headers<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_json(response: hyper::Response<Body>) -> Result<serde_json::Value> {
    let body = body_to_vec(response.into_body()).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Selectors a Lewisham portal page shows when every step can succeed.
#[allow(dead_code)]
pub fn lewisham_portal() -> PortalScript {
    use ticketpal::automation::issuers::lewisham_selectors::*;
    PortalScript::default()
        .element(PCN_INPUT, &[""])
        .element(VRM_INPUT, &[""])
        .element(SEARCH_BUTTON, &["Search"])
        .navigates(SEARCH_BUTTON, "https://pcnevidence.lewisham.gov.uk/pcnonline/details.php")
        .element(STATUS, &["Notice to Owner issued"])
        .element(GALLERY_IMAGES, &["photo-1", "photo-2"])
        .element(CHALLENGE_LINK, &["Challenge"])
        .element(REASON_SELECT, &[""])
        .element(DETAILS_TEXTAREA, &[""])
        .placeholder(DETAILS_TEXTAREA, "Explain why the penalty should be cancelled")
        .element(FULL_NAME_INPUT, &[""])
        .element(EMAIL_INPUT, &[""])
        .element(POSTCODE_INPUT, &[""])
        .element(FIND_ADDRESS_BUTTON, &["Find address"])
        .element(ADDRESS_RESULTS, &["3 Low Road, London", "1 High Street, London"])
        .element(DECLARATION_CHECKBOX, &[""])
        .element(SUBMIT_BUTTON, &["Submit"])
        .element(CONFIRMATION, &["Thank you"])
        .element(CONFIRMATION_REFERENCE, &["LBL-2024-0042"])
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE media, challenges, tickets, vehicles, issuer_automations, jobs, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
