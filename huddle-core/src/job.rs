//! Job coordinator state machine: employee roster, the single pending-job
//! slot, invitation surfacing, and the received-job stream.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PeerIdentity};
use crate::protocol::ConnectionState;

/// Service namespace for job discovery and invitations.
pub const JOB_SERVICE: &str = "jobmanager-jobs";

/// How long a job offer waits for the employee to pick up.
pub const JOB_INVITE_TIMEOUT: Duration = Duration::from_secs(120);

/// A unit of work offered to an employee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub due_date: DateTime<Utc>,
    pub payout: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        due_date: DateTime<Utc>,
        payout: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            due_date,
            payout: payout.into(),
        }
    }

    /// Wire form of a job record.
    pub fn to_payload(&self) -> Result<Vec<u8>, JobCodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, JobCodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("job codec error: {0}")]
pub struct JobCodecError(#[from] bincode::Error);

/// Terminal failure of the received-job stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStreamError {
    #[error("received job payload failed to decode: {0}")]
    Decode(String),
}

/// Side effect the driver must perform after a `JobCore` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    StartAdvertising,
    StopAdvertising,
    /// Deliver a job record over an established link.
    SendJob { to: PeerId, payload: Vec<u8> },
    /// Invite a not-yet-connected employee; the job itself is parked in the
    /// pending slot until the link comes up.
    Invite {
        to: PeerId,
        context: Vec<u8>,
        timeout: Duration,
    },
    /// Show an incoming offer to the user for an accept/decline decision.
    Surface { peer: PeerIdentity, job_name: String },
    /// Push a decoded job to the received-job stream.
    Publish(Job),
    /// Fail the received-job stream; no further jobs will be published.
    PublishError(JobStreamError),
}

/// Manager/employee state. Same ownership rule as `ChatCore`: one driver
/// task, mutation only through these methods.
pub struct JobCore {
    local: PeerIdentity,
    employees: HashSet<PeerIdentity>,
    /// At most one job waits for a link; a newer `invite_peer` replaces it.
    pending: Option<(PeerId, Job)>,
    receiving: bool,
    /// Cleared by the first decode failure; the stream stays closed after.
    stream_open: bool,
}

impl JobCore {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            employees: HashSet::new(),
            pending: None,
            receiving: false,
            stream_open: true,
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn employees(&self) -> &HashSet<PeerIdentity> {
        &self.employees
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn pending_job(&self) -> Option<(PeerId, &Job)> {
        self.pending.as_ref().map(|(id, job)| (*id, job))
    }

    /// Toggle availability for incoming offers. Advertising follows the flag.
    pub fn set_receiving(&mut self, receiving: bool) -> Vec<JobAction> {
        self.receiving = receiving;
        if receiving {
            vec![JobAction::StartAdvertising]
        } else {
            vec![JobAction::StopAdvertising]
        }
    }

    /// Browser saw an employee advertising for jobs.
    pub fn on_found(&mut self, peer: PeerIdentity) {
        self.employees.insert(peer);
    }

    /// Browser lost sight of an employee.
    pub fn on_lost(&mut self, peer: &PeerIdentity) {
        self.employees.remove(peer);
    }

    /// Offer `job` to an employee. An already-connected peer gets the record
    /// straight away; otherwise the job is parked and an invitation goes out
    /// with the job name as its context.
    pub fn invite_peer(
        &mut self,
        peer_id: PeerId,
        job: Job,
        connected: bool,
    ) -> Result<JobAction, JobCodecError> {
        if connected {
            let payload = job.to_payload()?;
            return Ok(JobAction::SendJob {
                to: peer_id,
                payload,
            });
        }
        let context = job.name.as_bytes().to_vec();
        self.pending = Some((peer_id, job));
        Ok(JobAction::Invite {
            to: peer_id,
            context,
            timeout: JOB_INVITE_TIMEOUT,
        })
    }

    /// Session peer-state transition. A `Connected` from the peer we parked a
    /// job for flushes the slot exactly once; the slot is cleared even when
    /// encoding fails so a stale job can never ambush a later connection.
    pub fn on_peer_state(&mut self, peer: &PeerIdentity, state: ConnectionState) -> Vec<JobAction> {
        if state != ConnectionState::Connected {
            return Vec::new();
        }
        let flush = matches!(&self.pending, Some((id, _)) if *id == peer.id);
        if !flush {
            return Vec::new();
        }
        let job = match self.pending.take() {
            Some((_, job)) => job,
            None => return Vec::new(),
        };
        match job.to_payload() {
            Ok(payload) => vec![JobAction::SendJob {
                to: peer.id,
                payload,
            }],
            Err(_) => Vec::new(),
        }
    }

    /// Incoming invitation under the job namespace. Context must carry a
    /// non-empty UTF-8 job name; absent, empty, or undecodable context is
    /// dropped without surfacing, so the decision channel never fires and
    /// the inviter times out.
    pub fn on_invitation(
        &mut self,
        peer: PeerIdentity,
        context: Option<Vec<u8>>,
    ) -> Option<JobAction> {
        let context = context.filter(|c| !c.is_empty())?;
        let job_name = String::from_utf8(context).ok()?;
        Some(JobAction::Surface { peer, job_name })
    }

    /// Inbound data on an established link is always a job record. One
    /// malformed record fails the stream for good.
    pub fn on_data(&mut self, _peer: &PeerIdentity, payload: &[u8]) -> Vec<JobAction> {
        if !self.stream_open {
            return Vec::new();
        }
        match Job::from_payload(payload) {
            Ok(job) => vec![JobAction::Publish(job)],
            Err(err) => {
                self.stream_open = false;
                vec![JobAction::PublishError(JobStreamError::Decode(
                    err.to_string(),
                ))]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use chrono::TimeZone;

    fn identity(name: &str) -> PeerIdentity {
        Keypair::generate().identity(name)
    }

    fn job(name: &str) -> Job {
        Job::new(
            name,
            Utc.timestamp_opt(1_767_225_600, 0).unwrap(),
            "$250",
        )
    }

    #[test]
    fn receiving_toggle_follows_advertising() {
        let mut core = JobCore::new(identity("Employee"));
        assert!(!core.is_receiving());
        assert_eq!(core.set_receiving(true), vec![JobAction::StartAdvertising]);
        assert!(core.is_receiving());
        assert_eq!(core.set_receiving(false), vec![JobAction::StopAdvertising]);
        assert!(!core.is_receiving());
    }

    #[test]
    fn employee_roster_is_a_set_keyed_by_id() {
        let mut core = JobCore::new(identity("Manager"));
        let kp = Keypair::generate();
        core.on_found(kp.identity("Phone"));
        core.on_found(kp.identity("Phone (renamed)"));
        assert_eq!(core.employees().len(), 1, "same id counts once");

        let other = identity("Tablet");
        core.on_found(other.clone());
        assert_eq!(core.employees().len(), 2);

        core.on_lost(&other);
        assert_eq!(core.employees().len(), 1);
    }

    #[test]
    fn invite_connected_peer_sends_immediately() {
        let mut core = JobCore::new(identity("Manager"));
        let employee = identity("Employee");
        let action = core.invite_peer(employee.id, job("Fix sink"), true).unwrap();
        match action {
            JobAction::SendJob { to, payload } => {
                assert_eq!(to, employee.id);
                assert_eq!(Job::from_payload(&payload).unwrap().name, "Fix sink");
            }
            other => panic!("expected SendJob, got {other:?}"),
        }
        assert!(core.pending_job().is_none(), "slot untouched on direct send");
    }

    #[test]
    fn invite_unconnected_peer_parks_job_and_invites() {
        let mut core = JobCore::new(identity("Manager"));
        let employee = identity("Employee");
        let action = core
            .invite_peer(employee.id, job("Mow lawn"), false)
            .unwrap();
        match action {
            JobAction::Invite {
                to,
                context,
                timeout,
            } => {
                assert_eq!(to, employee.id);
                assert_eq!(context, b"Mow lawn".to_vec());
                assert_eq!(timeout, JOB_INVITE_TIMEOUT);
            }
            other => panic!("expected Invite, got {other:?}"),
        }
        let (pending_id, pending) = core.pending_job().unwrap();
        assert_eq!(pending_id, employee.id);
        assert_eq!(pending.name, "Mow lawn");
    }

    #[test]
    fn newer_invite_replaces_parked_job() {
        let mut core = JobCore::new(identity("Manager"));
        let first = identity("First");
        let second = identity("Second");
        core.invite_peer(first.id, job("Old job"), false).unwrap();
        core.invite_peer(second.id, job("New job"), false).unwrap();
        let (pending_id, pending) = core.pending_job().unwrap();
        assert_eq!(pending_id, second.id);
        assert_eq!(pending.name, "New job");

        // The replaced peer connecting must not receive the new job.
        assert!(core
            .on_peer_state(&first, ConnectionState::Connected)
            .is_empty());
        assert!(core.pending_job().is_some());
    }

    #[test]
    fn parked_job_flushes_once_on_connect() {
        let mut core = JobCore::new(identity("Manager"));
        let employee = identity("Employee");
        core.invite_peer(employee.id, job("Paint fence"), false)
            .unwrap();

        let actions = core.on_peer_state(&employee, ConnectionState::Connected);
        match actions.as_slice() {
            [JobAction::SendJob { to, payload }] => {
                assert_eq!(*to, employee.id);
                assert_eq!(Job::from_payload(payload).unwrap().name, "Paint fence");
            }
            other => panic!("expected one SendJob, got {other:?}"),
        }
        assert!(core.pending_job().is_none());

        // A reconnect must not resend.
        assert!(core
            .on_peer_state(&employee, ConnectionState::Connected)
            .is_empty());
    }

    #[test]
    fn connecting_and_disconnect_leave_slot_alone() {
        let mut core = JobCore::new(identity("Manager"));
        let employee = identity("Employee");
        core.invite_peer(employee.id, job("Walk dog"), false).unwrap();
        assert!(core
            .on_peer_state(&employee, ConnectionState::Connecting)
            .is_empty());
        assert!(core
            .on_peer_state(&employee, ConnectionState::NotConnected)
            .is_empty());
        assert!(core.pending_job().is_some());
    }

    #[test]
    fn invitation_surfaces_only_with_utf8_context() {
        let mut core = JobCore::new(identity("Employee"));
        let manager = identity("Manager");

        let action = core.on_invitation(manager.clone(), Some(b"Shovel snow".to_vec()));
        match action {
            Some(JobAction::Surface { peer, job_name }) => {
                assert_eq!(peer, manager);
                assert_eq!(job_name, "Shovel snow");
            }
            other => panic!("expected Surface, got {other:?}"),
        }

        assert!(core.on_invitation(manager.clone(), None).is_none());
        assert!(core.on_invitation(manager.clone(), Some(Vec::new())).is_none());
        assert!(core
            .on_invitation(manager, Some(vec![0xff, 0xfe]))
            .is_none());
    }

    #[test]
    fn job_stream_closes_after_first_bad_record() {
        let mut core = JobCore::new(identity("Employee"));
        let manager = identity("Manager");

        let good = job("Rake leaves").to_payload().unwrap();
        assert!(matches!(
            core.on_data(&manager, &good).as_slice(),
            [JobAction::Publish(j)] if j.name == "Rake leaves"
        ));

        let actions = core.on_data(&manager, b"\x01garbage");
        assert!(matches!(
            actions.as_slice(),
            [JobAction::PublishError(JobStreamError::Decode(_))]
        ));

        // Closed for good: even a well-formed record goes nowhere now.
        assert!(core.on_data(&manager, &good).is_empty());
    }

    #[test]
    fn job_payload_roundtrip() {
        let original = job("Clean gutters");
        let payload = original.to_payload().unwrap();
        assert_eq!(Job::from_payload(&payload).unwrap(), original);
    }
}
