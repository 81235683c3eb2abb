//! Jobs mode: flip yourself available for work and answer offers, or browse
//! for employees and send them jobs.

use std::error::Error;

use chrono::Utc;
use huddle_core::{Job, PeerIdentity};
use huddle_net::{Invitation, JobCoordinator, NetConfig};
use log::info;
use tokio::io::AsyncBufReadExt;

pub async fn run(name: &str, cfg: NetConfig) -> Result<(), Box<dyn Error>> {
    let (jobs, mut offers, mut incoming) = JobCoordinator::new(name, cfg);
    info!("jobs mode up as {}", jobs.local_identity());
    println!("you are {}", jobs.local_identity());
    print_help();

    let mut employees = jobs.employees();
    let mut roster: Vec<PeerIdentity> = Vec::new();
    let mut pending: Option<Invitation> = None;
    let mut stream_done = false;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(line.trim(), &jobs, &roster, &mut pending) {
                    break;
                }
            }
            offer = offers.recv() => {
                let Some(offer) = offer else { break };
                println!(
                    "{} offers you {:?}  (/accept or /decline)",
                    offer.peer, offer.job_name
                );
                if let Some(old) = pending.replace(offer) {
                    // One decision at a time; the older offer lapses.
                    old.respond(false);
                }
            }
            job = incoming.recv(), if !stream_done => match job {
                Some(Ok(job)) => println!(
                    "received job {:?}, due {}, pays {}",
                    job.name,
                    job.due_date.format("%Y-%m-%d"),
                    job.payout
                ),
                Some(Err(err)) => println!("job stream failed: {}", err),
                None => {
                    stream_done = true;
                    println!("job stream closed");
                }
            },
            res = employees.changed() => {
                res?;
                let list = employees.borrow().clone();
                if list != roster {
                    roster = list;
                    print_roster(&roster);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn handle_line(
    line: &str,
    jobs: &JobCoordinator,
    roster: &[PeerIdentity],
    pending: &mut Option<Invitation>,
) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/help" => print_help(),
        "/work" => {
            let receiving = !jobs.is_receiving_jobs();
            jobs.set_receiving_jobs(receiving);
            if receiving {
                println!("taking offers");
            } else {
                println!("off the clock");
            }
        }
        "/browse" => {
            jobs.start_browsing();
            println!("looking for employees");
        }
        "/employees" => print_roster(roster),
        "/accept" => match pending.take() {
            Some(offer) => {
                println!("accepted {:?}", offer.job_name);
                offer.respond(true);
            }
            None => println!("no offer waiting"),
        },
        "/decline" => match pending.take() {
            Some(offer) => {
                println!("declined {:?}", offer.job_name);
                offer.respond(false);
            }
            None => println!("no offer waiting"),
        },
        cmd if cmd.starts_with("/offer") => match parse_offer(cmd, roster) {
            Some((peer, job)) => {
                println!("offering {:?} to {}", job.name, peer);
                jobs.invite_peer(peer.id, job);
            }
            None => println!("usage: /offer N JOB NAME | PAYOUT"),
        },
        _ => println!("unknown command, /help lists them"),
    }
    true
}

/// `/offer 2 Fix the sink | $120` offers the second listed employee a job
/// named "Fix the sink" paying $120, due a week out.
fn parse_offer(cmd: &str, roster: &[PeerIdentity]) -> Option<(PeerIdentity, Job)> {
    let rest = cmd.strip_prefix("/offer")?.trim();
    let (index, rest) = rest.split_once(' ')?;
    let peer = roster
        .get(index.parse::<usize>().ok()?.checked_sub(1)?)?
        .clone();
    let (job_name, payout) = match rest.split_once('|') {
        Some((n, p)) => (n.trim(), p.trim()),
        None => (rest.trim(), "negotiable"),
    };
    if job_name.is_empty() {
        return None;
    }
    let due = Utc::now() + chrono::Duration::days(7);
    Some((peer, Job::new(job_name, due, payout)))
}

fn print_roster(roster: &[PeerIdentity]) {
    if roster.is_empty() {
        println!("no employees in sight");
        return;
    }
    println!("employees:");
    for (i, p) in roster.iter().enumerate() {
        println!("  [{}] {}", i + 1, p);
    }
}

fn print_help() {
    println!("commands:");
    println!("  /work                toggle taking offers (advertises you)");
    println!("  /browse              look for employees on the network");
    println!("  /employees           list discovered employees");
    println!("  /offer N NAME | PAY  offer the Nth employee a job");
    println!("  /accept, /decline    answer the pending offer");
    println!("  /quit                exit");
}
