use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{
        Query, State,
        rejection::{FormRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{RngExt, rng};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{Mutex, mpsc, watch},
    time::Instant,
};
use tower_http::trace::TraceLayer;

use super::{
    Credentials, STATUS_PENDING, STATUS_SUCCESS, SignalError, SignalMethod, SignalReply,
    format_id, parse_id,
};

pub const ANSWER_TTL: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const OFFER_QUEUE_DEPTH: usize = 1024;

/// Produces the response for every rejected request.
pub type DenyHandler = Arc<dyn Fn() -> Response + Send + Sync>;

/// Plain `404 Not Found` with an empty body, like any unknown route.
pub fn not_found() -> DenyHandler {
    status_deny(StatusCode::NOT_FOUND, Bytes::new())
}

pub fn status_deny(status: StatusCode, body: Bytes) -> DenyHandler {
    Arc::new(move || (status, body.clone()).into_response())
}

pub struct SignalServerOptions {
    pub answer_ttl: Duration,
    pub offer_queue_depth: usize,
    pub deny: DenyHandler,
}

impl Default for SignalServerOptions {
    fn default() -> Self {
        Self {
            answer_ttl: ANSWER_TTL,
            offer_queue_depth: OFFER_QUEUE_DEPTH,
            deny: not_found(),
        }
    }
}

struct PendingAnswer {
    owner_uid: u64,
    answer: Option<Vec<u8>>,
    expiry: Instant,
}

struct QueuedOffer {
    id: u64,
    payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
enum AnswerPoll {
    Pending,
    Ready(Vec<u8>),
}

pub struct SignalServer {
    credentials: Arc<Credentials>,
    answers: Mutex<HashMap<u64, PendingAnswer>>,
    offers_tx: mpsc::Sender<QueuedOffer>,
    offers_rx: Mutex<mpsc::Receiver<QueuedOffer>>,
    answer_ttl: Duration,
    deny: DenyHandler,
}

#[derive(Debug, Deserialize)]
struct OfferForm {
    offer: String,
    mac: String,
    uid: String,
}

#[derive(Debug, Deserialize)]
struct AnswerQuery {
    oid: String,
    uid: String,
}

fn random_id() -> u64 {
    rng().random::<u64>()
}

impl SignalServer {
    pub fn new(credentials: Arc<Credentials>, opts: SignalServerOptions) -> Self {
        let (offers_tx, offers_rx) = mpsc::channel(opts.offer_queue_depth.max(1));
        Self {
            credentials,
            answers: Mutex::new(HashMap::new()),
            offers_tx,
            offers_rx: Mutex::new(offers_rx),
            answer_ttl: opts.answer_ttl,
            deny: opts.deny,
        }
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub async fn add_password(&self, uid: u64, secret: Vec<u8>) {
        self.credentials.add(uid, secret).await;
    }

    pub async fn remove_password(&self, uid: u64) -> bool {
        self.credentials.remove(uid).await
    }

    /// Number of answer slots currently held, expired-but-unswept ones included.
    pub async fn pending_answers(&self) -> usize {
        self.answers.lock().await.len()
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/offer", post(post_offer).fallback(deny_route))
            .route("/answer", get(get_answer).fallback(deny_route))
            .fallback(deny_route)
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serves the HTTP routes and runs the expiry sweeper until `shutdown` flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("signal: listener address")?;
        tracing::info!(listen_addr = %addr, "signal: listening");

        let sweeper = tokio::spawn(sweep_loop(self.clone(), shutdown.clone()));

        let mut stop = shutdown;
        let res = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|v| *v).await;
            })
            .await;

        sweeper.abort();
        res.context("signal: http server")
    }

    /// Removes every expired answer slot and returns how many were removed.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let mut answers = self.answers.lock().await;
        let before = answers.len();
        answers.retain(|_, a| a.expiry > now);
        before - answers.len()
    }

    fn deny(&self) -> Response {
        (self.deny)()
    }

    async fn authenticate(&self, form: &OfferForm) -> Option<(u64, Vec<u8>)> {
        let payload = BASE64.decode(&form.offer).ok()?;
        let tag = BASE64.decode(&form.mac).ok()?;
        let uid = parse_id(&form.uid)?;
        if !self.credentials.verify(uid, &payload, &tag).await {
            return None;
        }
        Some((uid, payload))
    }

    /// Queues the offer and creates its empty answer slot in one critical section.
    async fn accept_offer(&self, owner_uid: u64, payload: Vec<u8>) -> Option<u64> {
        let mut answers = self.answers.lock().await;
        let now = Instant::now();

        let mut id = random_id();
        while answers.get(&id).is_some_and(|a| a.expiry > now) {
            id = random_id();
        }

        if let Err(err) = self.offers_tx.try_send(QueuedOffer { id, payload }) {
            tracing::warn!(err = %err, "signal: offer queue rejected offer");
            return None;
        }

        answers.insert(
            id,
            PendingAnswer {
                owner_uid,
                answer: None,
                expiry: now + self.answer_ttl,
            },
        );
        Some(id)
    }

    async fn take_answer(&self, uid: u64, offer_id: u64) -> Option<AnswerPoll> {
        let mut answers = self.answers.lock().await;
        let entry = answers.get(&offer_id)?;
        if entry.owner_uid != uid || entry.expiry <= Instant::now() {
            return None;
        }
        if entry.answer.is_none() {
            return Some(AnswerPoll::Pending);
        }
        answers
            .remove(&offer_id)
            .and_then(|a| a.answer)
            .map(AnswerPoll::Ready)
    }
}

async fn sweep_loop(server: Arc<SignalServer>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = server.sweep_expired(Instant::now()).await;
                if removed > 0 {
                    tracing::debug!(removed, "signal: swept expired answers");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn deny_route(State(srv): State<Arc<SignalServer>>) -> Response {
    srv.deny()
}

async fn post_offer(
    State(srv): State<Arc<SignalServer>>,
    form: Result<Form<OfferForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return srv.deny();
    };
    let Some((uid, payload)) = srv.authenticate(&form).await else {
        tracing::debug!("signal: offer rejected");
        return srv.deny();
    };
    let Some(id) = srv.accept_offer(uid, payload).await else {
        return srv.deny();
    };

    tracing::debug!(uid = %format_id(uid), offer_id = %format_id(id), "signal: offer accepted");
    Json(SignalReply {
        status: STATUS_SUCCESS.into(),
        offer_id: Some(format_id(id)),
        answer: None,
    })
    .into_response()
}

async fn get_answer(
    State(srv): State<Arc<SignalServer>>,
    query: Result<Query<AnswerQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(q)) = query else {
        return srv.deny();
    };
    let (Some(oid), Some(uid)) = (parse_id(&q.oid), parse_id(&q.uid)) else {
        return srv.deny();
    };

    match srv.take_answer(uid, oid).await {
        None => srv.deny(),
        Some(AnswerPoll::Pending) => Json(SignalReply {
            status: STATUS_PENDING.into(),
            ..Default::default()
        })
        .into_response(),
        Some(AnswerPoll::Ready(answer)) => Json(SignalReply {
            status: STATUS_SUCCESS.into(),
            offer_id: None,
            answer: Some(BASE64.encode(answer)),
        })
        .into_response(),
    }
}

#[async_trait]
impl SignalMethod for SignalServer {
    async fn offer(&self, _payload: &[u8]) -> Result<u64, SignalError> {
        Err(SignalError::NotImplemented("signal server"))
    }

    async fn read_answer(&self, _offer_id: u64) -> Result<Vec<u8>, SignalError> {
        Err(SignalError::NotImplemented("signal server"))
    }

    async fn read_offer(&self) -> Result<(u64, Vec<u8>), SignalError> {
        let mut rx = self.offers_rx.lock().await;
        let offer = rx.recv().await.ok_or(SignalError::QueueClosed)?;
        Ok((offer.id, offer.payload))
    }

    /// Attaches the answer to a live slot. The first answer wins.
    async fn answer(&self, offer_id: u64, payload: &[u8]) -> Result<(), SignalError> {
        let mut answers = self.answers.lock().await;
        match answers.get_mut(&offer_id) {
            Some(slot) if slot.expiry > Instant::now() && slot.answer.is_none() => {
                slot.answer = Some(payload.to_vec());
                Ok(())
            }
            _ => Err(SignalError::OfferNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigtun::signal::{SignalClient, SignalClientOptions, auth::sign};

    fn credentials() -> Arc<Credentials> {
        Arc::new(Credentials::new(HashMap::from([(7, b"s3cr3t".to_vec())])))
    }

    async fn spawn_server(
        opts: SignalServerOptions,
    ) -> (Arc<SignalServer>, String, watch::Sender<bool>) {
        let srv = Arc::new(SignalServer::new(credentials(), opts));
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", ln.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(srv.clone().serve(ln, rx));
        (srv, base, tx)
    }

    fn client(base: &str, uid: u64, password: &[u8]) -> SignalClient {
        SignalClient::new(SignalClientOptions {
            poll_interval: Duration::from_millis(20),
            ..SignalClientOptions::new(base, uid, password.to_vec())
        })
        .unwrap()
    }

    async fn raw_offer(base: &str, uid: &str, payload: &[u8], tag: &[u8]) -> (u16, Bytes) {
        let resp = reqwest::Client::new()
            .post(format!("{base}/offer"))
            .form(&[
                ("offer", BASE64.encode(payload)),
                ("mac", BASE64.encode(tag)),
                ("uid", uid.to_string()),
            ])
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.bytes().await.unwrap())
    }

    #[tokio::test]
    async fn answer_is_delivered_exactly_once() {
        let (srv, base, _stop) = spawn_server(SignalServerOptions::default()).await;
        let c = client(&base, 7, b"s3cr3t");

        let oid = c.offer(b"hello").await.unwrap();
        let (got_id, got) = srv.read_offer().await.unwrap();
        assert_eq!(got_id, oid);
        assert_eq!(got, b"hello");

        let waiter = tokio::spawn(async move {
            let answer = c.read_answer(oid).await;
            (c, answer)
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        srv.answer(oid, b"world").await.unwrap();

        let (c, answer) = waiter.await.unwrap();
        assert_eq!(answer.unwrap(), b"world");

        match c.read_answer(oid).await {
            Err(SignalError::BadResponse { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(srv.pending_answers().await, 0);
    }

    #[tokio::test]
    async fn pending_poll_does_not_consume_the_slot() {
        let (srv, base, _stop) = spawn_server(SignalServerOptions::default()).await;
        let oid = client(&base, 7, b"s3cr3t").offer(b"o").await.unwrap();

        let url = format!("{base}/answer?oid={}&uid=7", format_id(oid));
        for _ in 0..2 {
            let reply: SignalReply = reqwest::get(&url).await.unwrap().json().await.unwrap();
            assert_eq!(reply.status, STATUS_PENDING);
        }
        assert_eq!(srv.pending_answers().await, 1);

        // Another user cannot see the slot.
        let foreign = format!("{base}/answer?oid={}&uid=8", format_id(oid));
        assert_eq!(reqwest::get(&foreign).await.unwrap().status(), 404);
    }

    #[tokio::test]
    async fn auth_failures_are_indistinguishable_from_unknown_routes() {
        let (_srv, base, _stop) = spawn_server(SignalServerOptions::default()).await;

        let wrong_mac = raw_offer(&base, "7", b"hello", &sign(b"nope", b"hello")).await;
        let unknown_uid = raw_offer(&base, "8", b"hello", &sign(b"s3cr3t", b"hello")).await;
        let bad_uid = raw_offer(&base, "zz", b"hello", &sign(b"s3cr3t", b"hello")).await;
        assert_eq!(wrong_mac, unknown_uid);
        assert_eq!(wrong_mac, bad_uid);
        assert_eq!(wrong_mac.0, 404);
        assert!(wrong_mac.1.is_empty());

        let http = reqwest::Client::new();
        for resp in [
            http.get(format!("{base}/nothing")).send().await.unwrap(),
            http.get(format!("{base}/offer")).send().await.unwrap(),
            http.post(format!("{base}/answer")).send().await.unwrap(),
            http.get(format!("{base}/answer")).send().await.unwrap(),
            http.post(format!("{base}/offer")).body("x").send().await.unwrap(),
        ] {
            assert_eq!(resp.status(), 404);
            assert!(resp.bytes().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn custom_deny_handler_is_used_everywhere() {
        let opts = SignalServerOptions {
            deny: status_deny(StatusCode::IM_A_TEAPOT, Bytes::from_static(b"<html/>")),
            ..Default::default()
        };
        let (_srv, base, _stop) = spawn_server(opts).await;

        let (status, body) = raw_offer(&base, "7", b"x", b"bad").await;
        assert_eq!(status, 418);
        assert_eq!(&body[..], b"<html/>");

        let resp = reqwest::get(format!("{base}/elsewhere")).await.unwrap();
        assert_eq!(resp.status(), 418);
    }

    #[tokio::test]
    async fn added_and_removed_users_take_effect() {
        let (srv, base, _stop) = spawn_server(SignalServerOptions::default()).await;
        let c = client(&base, 9, b"late");
        assert!(c.offer(b"x").await.is_err());

        srv.add_password(9, b"late".to_vec()).await;
        assert!(c.offer(b"x").await.is_ok());

        assert!(srv.remove_password(9).await);
        assert!(c.offer(b"x").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_slots_are_absent_and_sweeping_is_idempotent() {
        let srv = SignalServer::new(credentials(), SignalServerOptions::default());
        let stale = srv.accept_offer(7, b"a".to_vec()).await.unwrap();

        tokio::time::advance(ANSWER_TTL + Duration::from_secs(1)).await;
        let fresh = srv.accept_offer(7, b"b".to_vec()).await.unwrap();

        // Unswept but expired.
        assert_eq!(srv.take_answer(7, stale).await, None);
        assert!(matches!(
            srv.answer(stale, b"late").await,
            Err(SignalError::OfferNotFound)
        ));

        assert_eq!(srv.sweep_expired(Instant::now()).await, 1);
        assert_eq!(srv.sweep_expired(Instant::now()).await, 0);

        srv.answer(fresh, b"ok").await.unwrap();
        assert!(matches!(
            srv.answer(fresh, b"again").await,
            Err(SignalError::OfferNotFound)
        ));
        assert_eq!(
            srv.take_answer(7, fresh).await,
            Some(AnswerPoll::Ready(b"ok".to_vec()))
        );
        assert_eq!(srv.sweep_expired(Instant::now()).await, 0);
        assert_eq!(srv.pending_answers().await, 0);
    }

    #[tokio::test]
    async fn full_offer_queue_rejects_without_creating_a_slot() {
        let opts = SignalServerOptions {
            offer_queue_depth: 1,
            ..Default::default()
        };
        let srv = SignalServer::new(credentials(), opts);

        assert!(srv.accept_offer(7, b"1".to_vec()).await.is_some());
        assert!(srv.accept_offer(7, b"2".to_vec()).await.is_none());
        assert_eq!(srv.pending_answers().await, 1);

        let (_, payload) = srv.read_offer().await.unwrap();
        assert_eq!(payload, b"1");
        assert!(srv.accept_offer(7, b"3".to_vec()).await.is_some());
    }

    #[tokio::test]
    async fn client_role_methods_are_not_implemented() {
        let srv = SignalServer::new(credentials(), SignalServerOptions::default());
        assert!(matches!(
            srv.offer(b"x").await,
            Err(SignalError::NotImplemented(_))
        ));
        assert!(matches!(
            srv.read_answer(1).await,
            Err(SignalError::NotImplemented(_))
        ));
    }
}
