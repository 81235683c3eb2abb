//! Job coordinator: drives `JobCore` with the same owner-task discipline as
//! chat. Invitations are republished with a live decision channel; received
//! jobs stream out until the first decode failure ends the stream.

use std::sync::Arc;

use huddle_core::identity::{Keypair, PeerId, PeerIdentity};
use huddle_core::job::{Job, JobAction, JobCore, JobStreamError, JOB_SERVICE};
use huddle_core::protocol::{ConnectionState, Reliability};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::advertiser::{Advertiser, AdvertiserEvent};
use crate::browser::{Browser, BrowserEvent};
use crate::config::NetConfig;
use crate::session::{Session, SessionEvent};

/// An incoming job offer awaiting the user's verdict. Dropping it undecided
/// declines, so a dismissed dialog cannot leave the inviter hanging past
/// its timeout.
pub struct Invitation {
    pub job_name: String,
    pub peer: PeerIdentity,
    decision: oneshot::Sender<bool>,
}

impl Invitation {
    pub fn respond(self, accept: bool) {
        let _ = self.decision.send(accept);
    }
}

enum JobCmd {
    SetReceiving(bool),
    StartBrowsing,
    StopBrowsing,
    InvitePeer { peer_id: PeerId, job: Job },
}

/// Handle to a running job coordinator.
#[derive(Clone)]
pub struct JobCoordinator {
    cmd: mpsc::UnboundedSender<JobCmd>,
    local: PeerIdentity,
    employees: watch::Receiver<Vec<PeerIdentity>>,
    receiving: watch::Receiver<bool>,
}

impl JobCoordinator {
    /// Spawn a job coordinator with a fresh keypair. Returns the handle plus
    /// the invitation stream and the error-terminated received-job stream.
    /// Must be called from within a tokio runtime.
    pub fn new(
        display_name: &str,
        config: NetConfig,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Invitation>,
        mpsc::UnboundedReceiver<Result<Job, JobStreamError>>,
    ) {
        Self::with_keypair(Arc::new(Keypair::generate()), display_name, config)
    }

    pub fn with_keypair(
        keypair: Arc<Keypair>,
        display_name: &str,
        config: NetConfig,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Invitation>,
        mpsc::UnboundedReceiver<Result<Job, JobStreamError>>,
    ) {
        let local = keypair.identity(display_name);
        let (session, session_rx) = Session::new(keypair.clone(), local.clone());
        let (advertiser, adv_rx) =
            Advertiser::new(local.clone(), keypair.clone(), JOB_SERVICE, config.clone());
        let (browser, browser_rx) = Browser::new(local.clone(), keypair, JOB_SERVICE, config);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (invitations_tx, invitations_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (employees_tx, employees_rx) = watch::channel(Vec::new());
        let (receiving_tx, receiving_rx) = watch::channel(false);

        let driver = JobDriver {
            core: JobCore::new(local.clone()),
            session,
            advertiser,
            browser,
            cmd_rx,
            session_rx,
            adv_rx,
            browser_rx,
            invitations_tx,
            jobs_tx: Some(jobs_tx),
            employees_tx,
            receiving_tx,
        };
        tokio::spawn(driver.run());

        (
            Self {
                cmd: cmd_tx,
                local,
                employees: employees_rx,
                receiving: receiving_rx,
            },
            invitations_rx,
            jobs_rx,
        )
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    /// Make this peer available (or unavailable) for incoming offers.
    pub fn set_receiving_jobs(&self, receiving: bool) {
        let _ = self.cmd.send(JobCmd::SetReceiving(receiving));
    }

    pub fn is_receiving_jobs(&self) -> bool {
        *self.receiving.borrow()
    }

    pub fn receiving_jobs(&self) -> watch::Receiver<bool> {
        self.receiving.clone()
    }

    /// Start collecting employees advertising for jobs.
    pub fn start_browsing(&self) {
        let _ = self.cmd.send(JobCmd::StartBrowsing);
    }

    pub fn stop_browsing(&self) {
        let _ = self.cmd.send(JobCmd::StopBrowsing);
    }

    /// Offer a job to an employee; delivers immediately over a live link,
    /// otherwise parks the job and invites the peer.
    pub fn invite_peer(&self, peer_id: PeerId, job: Job) {
        let _ = self.cmd.send(JobCmd::InvitePeer { peer_id, job });
    }

    /// Observable employee roster, sorted by display name.
    pub fn employees(&self) -> watch::Receiver<Vec<PeerIdentity>> {
        self.employees.clone()
    }
}

struct JobDriver {
    core: JobCore,
    session: Session,
    advertiser: Advertiser,
    browser: Browser,
    cmd_rx: mpsc::UnboundedReceiver<JobCmd>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    adv_rx: mpsc::UnboundedReceiver<AdvertiserEvent>,
    browser_rx: mpsc::UnboundedReceiver<BrowserEvent>,
    invitations_tx: mpsc::UnboundedSender<Invitation>,
    /// `None` once the stream has been failed by a bad record.
    jobs_tx: Option<mpsc::UnboundedSender<Result<Job, JobStreamError>>>,
    employees_tx: watch::Sender<Vec<PeerIdentity>>,
    receiving_tx: watch::Sender<bool>,
}

impl JobDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                },
                Some(ev) = self.session_rx.recv() => self.handle_session_event(ev).await,
                Some(ev) = self.adv_rx.recv() => self.handle_invitation(ev),
                Some(ev) = self.browser_rx.recv() => self.handle_browser_event(ev),
            }
        }
        self.advertiser.stop();
        self.browser.stop_browsing();
        self.session.disconnect().await;
    }

    async fn handle_cmd(&mut self, cmd: JobCmd) {
        match cmd {
            JobCmd::SetReceiving(receiving) => {
                let actions = self.core.set_receiving(receiving);
                self.apply(actions).await;
                self.receiving_tx.send_replace(self.core.is_receiving());
            }
            JobCmd::StartBrowsing => {
                if let Err(err) = self.browser.start_browsing().await {
                    warn!("cannot start job browser: {err}");
                }
            }
            JobCmd::StopBrowsing => self.browser.stop_browsing(),
            JobCmd::InvitePeer { peer_id, job } => {
                let connected = self.session.is_connected(peer_id).await;
                match self.core.invite_peer(peer_id, job, connected) {
                    Ok(action) => self.apply(vec![action]).await,
                    Err(err) => warn!("cannot encode job for {peer_id}: {err}"),
                }
            }
        }
    }

    async fn handle_session_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::PeerState { peer, state } => {
                if state == ConnectionState::Connecting {
                    debug!("Connecting to: {peer}");
                }
                let actions = self.core.on_peer_state(&peer, state);
                self.apply(actions).await;
            }
            SessionEvent::DataReceived { peer, payload } => {
                let actions = self.core.on_data(&peer, &payload);
                self.apply(actions).await;
            }
            SessionEvent::ResourceReceiveStarted { peer, name } => {
                debug!("unexpected resource {name} from {peer} on job session");
            }
            SessionEvent::ResourceReceiveFinished { path, .. } => {
                // Job sessions carry no resources; discard whatever landed.
                if let Some(path) = path {
                    let _ = tokio::fs::remove_file(path).await;
                }
            }
        }
    }

    fn handle_invitation(&mut self, ev: AdvertiserEvent) {
        let AdvertiserEvent::Invitation {
            peer,
            context,
            responder,
        } = ev;
        match self.core.on_invitation(peer.clone(), context) {
            Some(JobAction::Surface { peer, job_name }) => {
                let (tx, rx) = oneshot::channel::<bool>();
                let invitation = Invitation {
                    job_name,
                    peer,
                    decision: tx,
                };
                if self.invitations_tx.send(invitation).is_err() {
                    responder.decline();
                    return;
                }
                let session = self.session.clone();
                tokio::spawn(async move {
                    match rx.await {
                        Ok(true) => responder.accept(&session),
                        _ => responder.decline(),
                    }
                });
            }
            // Missing or undecodable context: never surfaced. The dropped
            // responder declines the connection.
            _ => debug!("ignoring job invitation from {peer} without usable context"),
        }
    }

    fn handle_browser_event(&mut self, ev: BrowserEvent) {
        match ev {
            BrowserEvent::PeerFound { peer, .. } => {
                debug!("employee available: {peer}");
                self.core.on_found(peer);
            }
            BrowserEvent::PeerLost { peer } => {
                debug!("employee gone: {peer}");
                self.core.on_lost(&peer);
            }
        }
        self.publish_employees();
    }

    async fn apply(&mut self, actions: Vec<JobAction>) {
        for action in actions {
            match action {
                JobAction::StartAdvertising => {
                    if let Err(err) = self.advertiser.start().await {
                        warn!("cannot start job advertiser: {err}");
                    }
                }
                JobAction::StopAdvertising => self.advertiser.stop(),
                JobAction::SendJob { to, payload } => {
                    if let Err(err) = self
                        .session
                        .send(&payload, &[to], Reliability::Reliable)
                        .await
                    {
                        warn!("job delivery to {to} failed: {err}");
                    }
                }
                JobAction::Invite {
                    to,
                    context,
                    timeout,
                } => {
                    let invited = self
                        .browser
                        .invite(to, &self.session, Some(context), timeout)
                        .await;
                    if let Err(err) = invited {
                        warn!("job invite failed: {err}");
                    }
                }
                JobAction::Publish(job) => {
                    if let Some(tx) = &self.jobs_tx {
                        let _ = tx.send(Ok(job));
                    }
                }
                JobAction::PublishError(err) => {
                    // One bad record ends the stream: the error is the last
                    // item the receiver sees.
                    if let Some(tx) = self.jobs_tx.take() {
                        let _ = tx.send(Err(err));
                    }
                }
                JobAction::Surface { .. } => {
                    // Produced only by on_invitation, handled in place.
                }
            }
        }
    }

    fn publish_employees(&self) {
        let mut list: Vec<PeerIdentity> = self.core.employees().iter().cloned().collect();
        list.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.employees_tx.send_replace(list);
    }
}
