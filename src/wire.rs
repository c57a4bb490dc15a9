use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::{Credentials, Role};
use crate::command::{parse_request, Notification, Reply, Request};
use crate::engine::{Engine, EngineError};
use crate::limits::{MAX_LINE_LEN, MAX_REQUESTER_LEN};
use crate::model::*;
use crate::slots::{self, Window};
use crate::tenant::TenantManager;

type Lines = Framed<TcpStream, LinesCodec>;

async fn send_line(framed: &mut Lines, line: String) -> io::Result<()> {
    framed.send(line).await.map_err(codec_err)
}

async fn send_reply(framed: &mut Lines, reply: &Reply) -> io::Result<()> {
    let line = serde_json::to_string(reply).map_err(io::Error::other)?;
    send_line(framed, line).await
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// One authenticated connection bound to a site.
struct Session {
    engine: Arc<Engine>,
    role: Role,
    /// The requester a client session acts as. `None` for operators.
    identity: Option<RequesterId>,
    /// Forwarder task per LISTENed resource.
    listeners: HashMap<Ulid, JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl Session {
    fn listen(&mut self, resource_id: Ulid) {
        let mut rx = self.engine.notify.subscribe(resource_id);
        let tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("listener on {resource_id} lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.listeners.insert(resource_id, handle) {
            old.abort();
        }
    }

    fn unlisten(&mut self, resource_id: &Ulid) -> bool {
        match self.listeners.remove(resource_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn unlisten_all(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }

    /// Clients may only act as the requester named in `hello`, and may not
    /// change resources, caps or booking outcomes.
    fn authorize(&self, req: &Request) -> Result<(), Reply> {
        if self.role == Role::Operator {
            return Ok(());
        }
        match req {
            Request::LoadResource { .. }
            | Request::Complete { .. }
            | Request::SetRequesterCap { .. } => Err(Reply::failure(
                "not_authorized",
                "operator access required",
                false,
            )),
            Request::Reserve { requester, .. }
            | Request::Cancel { requester, .. }
            | Request::RequesterBookings { requester }
                if self.identity.as_deref() != Some(requester.as_str()) =>
            {
                Err(Reply::failure(
                    "not_authorized",
                    format!("session may not act as requester {requester}"),
                    false,
                ))
            }
            _ => Ok(()),
        }
    }

    async fn execute(&mut self, req: Request) -> Result<Reply, EngineError> {
        let engine = self.engine.clone();
        match req {
            Request::Hello { .. } => Ok(Reply::failure(
                "bad_request",
                "already authenticated",
                false,
            )),
            Request::LoadResource { resource } => {
                engine.load_resource(resource).await?;
                Ok(Reply::done())
            }
            Request::ListResources => {
                let resources = engine.list_resources();
                let list: Vec<&Resource> = resources.iter().map(|r| r.as_ref()).collect();
                Ok(Reply::data(list))
            }
            Request::Generate {
                start,
                end,
                slot_minutes,
            } => {
                let duration = chrono::Duration::try_minutes(slot_minutes)
                    .ok_or(EngineError::InvalidWindow("slot duration out of range"))?;
                let spans: Vec<Span> = slots::generate(&Window::new(start, end, duration))?.collect();
                Ok(Reply::data(spans))
            }
            Request::AvailableSlots { resource_id, date } => {
                Ok(Reply::data(engine.available_slots(resource_id, date)))
            }
            Request::IsFree {
                resource_id,
                date,
                start,
                end,
            } => Ok(Reply::data(engine.is_free(resource_id, date, &Span { start, end }))),
            Request::BookedSlots { resource_id, date } => {
                Ok(Reply::data(engine.booked_slots(resource_id, date)))
            }
            Request::Reserve {
                resource_id,
                date,
                start,
                end,
                requester,
            } => {
                let booking = engine
                    .reserve(resource_id, date, Span { start, end }, &requester)
                    .await?;
                Ok(Reply::data(booking))
            }
            Request::Cancel {
                booking_id,
                requester,
            } => {
                let principal = match self.role {
                    Role::Operator => Principal::operator(requester),
                    Role::Client => Principal::requester(requester),
                };
                Ok(Reply::data(engine.cancel(booking_id, &principal).await?))
            }
            Request::Complete { booking_id } => Ok(Reply::data(engine.complete(booking_id).await?)),
            Request::GetBooking { booking_id } => {
                Ok(Reply::data(engine.get_booking(booking_id).await?))
            }
            Request::ResourceBookings { resource_id, date } => {
                Ok(Reply::data(engine.bookings_for_resource(resource_id, date).await?))
            }
            Request::RequesterBookings { requester } => {
                Ok(Reply::data(engine.bookings_for_requester(&requester).await?))
            }
            Request::SetRequesterCap { requester, cap } => {
                engine.set_requester_cap(&requester, cap).await?;
                Ok(Reply::done())
            }
            Request::Listen { resource_id } => {
                self.listen(resource_id);
                Ok(Reply::done())
            }
            Request::Unlisten { resource_id } => Ok(Reply::data(self.unlisten(&resource_id))),
        }
    }

    async fn handle_line(&mut self, line: &str) -> Reply {
        let req = match parse_request(line) {
            Ok(req) => req,
            Err(e) => return e.into(),
        };
        let op = crate::observability::op_label(&req);
        let start = Instant::now();
        let reply = match self.authorize(&req) {
            Ok(()) => self.execute(req).await.unwrap_or_else(Reply::from),
            Err(refused) => refused,
        };
        metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => reply.status_label())
            .increment(1);
        metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        if let Some(ref err) = reply.error {
            debug!("{op} failed: {}", err.message);
        }
        reply
    }
}

/// Expect `hello` as the first line. `None` means the connection should close.
async fn handshake(
    framed: &mut Lines,
    tenants: &TenantManager,
    credentials: &Credentials,
) -> io::Result<Option<(Arc<Engine>, Role, Option<RequesterId>)>> {
    let Some(first) = framed.next().await else {
        return Ok(None);
    };
    let first = first.map_err(codec_err)?;

    let (site, password, requester) = match parse_request(&first) {
        Ok(Request::Hello {
            site,
            password,
            requester,
        }) => (site, password, requester),
        Ok(_) => {
            send_reply(framed, &Reply::failure("bad_request", "expected hello", false)).await?;
            return Ok(None);
        }
        Err(e) => {
            send_reply(framed, &e.into()).await?;
            return Ok(None);
        }
    };

    let Some(role) = credentials.authenticate(&password) else {
        metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        send_reply(framed, &Reply::failure("auth_failed", "invalid password", false)).await?;
        return Ok(None);
    };

    let identity = match (role, requester) {
        (Role::Operator, _) => None,
        (Role::Client, Some(requester)) if !requester.is_empty() && requester.len() <= MAX_REQUESTER_LEN => {
            Some(requester)
        }
        (Role::Client, _) => {
            let reply = Reply::failure("bad_request", "client sessions must name a requester", false);
            send_reply(framed, &reply).await?;
            return Ok(None);
        }
    };

    match tenants.get_or_create(&site) {
        Ok(engine) => {
            let hello = serde_json::json!({ "site": site, "requester": identity });
            send_reply(framed, &Reply::data(hello)).await?;
            Ok(Some((engine, role, identity)))
        }
        Err(e) => {
            send_reply(framed, &Reply::failure("site_error", format!("site error: {e}"), false)).await?;
            Ok(None)
        }
    }
}

/// Serve one client: handshake, then request/reply lines interleaved with
/// pushed notifications for LISTENed resources.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    credentials: Arc<Credentials>,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let Some((engine, role, identity)) = handshake(&mut framed, &tenants, &credentials).await? else {
        return Ok(());
    };
    if role == Role::Operator {
        info!("operator session opened");
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        engine,
        role,
        identity,
        listeners: HashMap::new(),
        events_tx,
    };

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::failure("bad_request", "line too long", false);
                        let _ = send_reply(&mut framed, &reply).await;
                        break Ok(());
                    }
                    Some(Err(LinesCodecError::Io(e))) => break Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = session.handle_line(&line).await;
                if let Err(e) = send_reply(&mut framed, &reply).await {
                    break Err(e);
                }
            }
            Some(event) = events_rx.recv() => {
                let Some(resource_id) = event.resource_id() else { continue };
                let note = Notification { resource_id, event: &event };
                let line = match serde_json::to_string(&note) {
                    Ok(line) => line,
                    Err(e) => break Err(io::Error::other(e)),
                };
                if let Err(e) = send_line(&mut framed, line).await {
                    break Err(e);
                }
            }
        }
    };

    session.unlisten_all();
    result
}
