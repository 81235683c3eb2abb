//! Chat mode: a line-oriented room. Type to talk, slash commands to move
//! between hosting, picking a room, and leaving.

use std::error::Error;

use huddle_core::{ChatMessage, PeerIdentity};
use huddle_net::{BrowserEvent, ChatCoordinator, ChatPicker, NetConfig};
use log::info;
use tokio::io::AsyncBufReadExt;

pub async fn run(name: &str, cfg: NetConfig) -> Result<(), Box<dyn Error>> {
    let chat = ChatCoordinator::new(name, cfg);
    info!("chat mode up as {}", chat.local_identity());
    println!("you are {}", chat.local_identity());
    print_help();

    let mut messages = chat.messages();
    let mut peers = chat.peers();
    let mut picker: Option<ChatPicker> = None;
    let mut candidates: Vec<PeerIdentity> = Vec::new();
    let mut shown: Vec<ChatMessage> = Vec::new();
    let mut roster: Vec<PeerIdentity> = Vec::new();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(line.trim(), &chat, &mut picker, &mut candidates).await {
                    break;
                }
            }
            ev = next_picker_event(&mut picker) => match ev {
                Some(BrowserEvent::PeerFound { peer, .. }) => {
                    if !candidates.contains(&peer) {
                        candidates.push(peer.clone());
                    }
                    println!("[{}] {}", candidates.len(), peer);
                }
                Some(BrowserEvent::PeerLost { peer }) => {
                    candidates.retain(|p| p != &peer);
                    println!("gone: {}", peer);
                }
                None => picker = None,
            },
            res = messages.changed() => {
                res?;
                let log = messages.borrow().clone();
                print_new_lines(&mut shown, &log);
            }
            res = peers.changed() => {
                res?;
                let list = peers.borrow().clone();
                for p in &list {
                    if !roster.contains(p) {
                        println!("* {} joined", p);
                    }
                }
                for p in &roster {
                    if !list.contains(p) {
                        println!("* {} left", p);
                    }
                }
                roster = list;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    chat.leave_chat();
    Ok(())
}

/// Resolve the next discovery update while a picker is open; park otherwise.
async fn next_picker_event(picker: &mut Option<ChatPicker>) -> Option<BrowserEvent> {
    match picker {
        Some(p) => p.next_event().await,
        None => std::future::pending().await,
    }
}

async fn handle_line(
    line: &str,
    chat: &ChatCoordinator,
    picker: &mut Option<ChatPicker>,
    candidates: &mut Vec<PeerIdentity>,
) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/help" => print_help(),
        "/host" => {
            chat.host();
            println!("hosting a room; waiting for joiners");
        }
        "/join" => {
            candidates.clear();
            match chat.join().await {
                Some(p) => {
                    *picker = Some(p);
                    println!("looking for rooms; /invite N to connect, /done once in");
                }
                None => println!("chat is shut down"),
            }
        }
        "/done" => match picker.take() {
            Some(p) => {
                p.finish();
                println!("picker closed");
            }
            None => println!("no picker open"),
        },
        "/cancel" => match picker.take() {
            Some(p) => {
                p.cancel();
                candidates.clear();
                println!("stopped looking");
            }
            None => println!("no picker open"),
        },
        "/peers" => {
            let list = chat.peers().borrow().clone();
            if list.is_empty() {
                println!("nobody connected");
            } else {
                for p in &list {
                    println!("  {}", p);
                }
            }
        }
        "/leave" => {
            chat.leave_chat();
            println!("left the room");
        }
        cmd if cmd.starts_with("/invite") => {
            let slot = cmd
                .strip_prefix("/invite")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .and_then(|n| n.checked_sub(1));
            match slot.and_then(|i| candidates.get(i)) {
                Some(peer) => match picker.as_ref() {
                    Some(p) => {
                        p.invite(peer.id);
                        println!("inviting {}", peer);
                    }
                    None => println!("no picker open; /join first"),
                },
                None => println!("usage: /invite N (from the numbered list)"),
            }
        }
        cmd if cmd.starts_with('/') => println!("unknown command, /help lists them"),
        text => chat.send(text),
    }
    true
}

fn print_new_lines(shown: &mut Vec<ChatMessage>, log: &[ChatMessage]) {
    if log.is_empty() {
        shown.clear();
        return;
    }
    if log.len() >= shown.len() && log[..shown.len()] == shown[..] {
        for m in &log[shown.len()..] {
            println!("<{}> {}", m.display_name, m.body);
        }
    } else {
        // History splices in at the front; repaint the room in order.
        println!("--- history ---");
        for m in log {
            println!("<{}> {}", m.display_name, m.body);
        }
    }
    *shown = log.to_vec();
}

fn print_help() {
    println!("commands:");
    println!("  /host      open a room and let others in");
    println!("  /join      look for rooms nearby");
    println!("  /invite N  connect to the Nth discovered room");
    println!("  /done      close the picker once connected");
    println!("  /cancel    close the picker and back out");
    println!("  /peers     list who is connected");
    println!("  /leave     leave the room");
    println!("  /quit      exit");
    println!("anything else is sent as a chat line");
}
