/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use crate::receiver::{Command, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Unparsed,
    Blocked,
    Executing,
    Finished,
    Retired,
}

/// Commands in the same nonzero group may run concurrently; group 0
/// commands run alone. A command whose group differs from the leading
/// running command blocks until the pipeline drains.
pub fn group_for(command: Command) -> u32 {
    match command {
        Command::Noop | Command::Capability | Command::Id => 1,
        Command::List
        | Command::Lsub
        | Command::Status
        | Command::Subscribe
        | Command::Unsubscribe => 2,
        _ => 0,
    }
}

pub struct CommandSlot {
    pub id: u64,
    pub request: Request,
    pub group: u32,
    pub state: CommandState,
    /// false once the command has failed; error responses jump the
    /// emission queue.
    pub ok: bool,
    responses: Vec<Vec<u8>>,
}

/// The per-connection command list. The session owns the arena;
/// commands are referred to by integer id only, so a handler can hold
/// its own id without borrowing the whole list.
pub struct CommandArena {
    slots: Vec<CommandSlot>,
    next_id: u64,
}

impl CommandArena {
    pub fn new() -> CommandArena {
        CommandArena {
            slots: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add(&mut self, request: Request) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.push(CommandSlot {
            id,
            group: group_for(request.command),
            request,
            state: CommandState::Unparsed,
            ok: true,
            responses: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: u64) -> Option<&CommandSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut CommandSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn respond(&mut self, id: u64, bytes: Vec<u8>) {
        if let Some(slot) = self.get_mut(id) {
            slot.responses.push(bytes);
        }
    }

    pub fn set_state(&mut self, id: u64, state: CommandState) {
        if let Some(slot) = self.get_mut(id) {
            slot.state = state;
        }
    }

    pub fn set_failed(&mut self, id: u64) {
        if let Some(slot) = self.get_mut(id) {
            slot.ok = false;
        }
    }

    /// Selects the next commands to run and marks them Executing. If
    /// commands are already running, only same-group followers may
    /// join them; otherwise the oldest waiting command leads, followed
    /// by waiting commands of its group. A waiting command of a
    /// different group becomes Blocked.
    pub fn start_block(&mut self) -> Vec<u64> {
        let running_group = self
            .slots
            .iter()
            .find(|s| {
                matches!(s.state, CommandState::Executing | CommandState::Finished)
            })
            .map(|s| s.group);

        let group = match running_group {
            Some(group) => group,
            None => {
                match self
                    .slots
                    .iter()
                    .find(|s| {
                        matches!(s.state, CommandState::Unparsed | CommandState::Blocked)
                    })
                    .map(|s| s.group)
                {
                    Some(group) => group,
                    None => return Vec::new(),
                }
            }
        };

        let mut started = Vec::new();
        let solo = group == 0;
        for slot in &mut self.slots {
            if !matches!(slot.state, CommandState::Unparsed | CommandState::Blocked) {
                continue;
            }
            if slot.group == group && !(solo && (running_group.is_some() || !started.is_empty())) {
                slot.state = CommandState::Executing;
                started.push(slot.id);
                if solo {
                    break;
                }
            } else {
                // The frontier stops at the first group change.
                slot.state = CommandState::Blocked;
                break;
            }
        }
        started
    }

    /// Emits responses for Finished commands in arrival order,
    /// halting at the first command that is not finished, so tagged
    /// responses never precede untagged data they describe. Error
    /// responses are always emitted.
    pub fn emit_responses(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut deferred = false;
        for slot in &mut self.slots {
            match slot.state {
                CommandState::Finished => {
                    if !deferred || !slot.ok {
                        out.append(&mut slot.responses);
                        slot.state = CommandState::Retired;
                    }
                }
                CommandState::Retired => {}
                _ => deferred = true,
            }
        }
        self.slots.retain(|s| s.state != CommandState::Retired);
        out
    }

}

impl Default for CommandArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Request;

    fn request(tag: &str, command: Command) -> Request {
        Request {
            tag: tag.into(),
            command,
            tokens: vec![],
        }
    }

    #[test]
    fn groups() {
        assert_eq!(group_for(Command::Noop), group_for(Command::Capability));
        assert_eq!(group_for(Command::List), group_for(Command::Lsub));
        assert_ne!(group_for(Command::Noop), group_for(Command::List));
        assert_eq!(group_for(Command::Select), 0);
        assert_eq!(group_for(Command::Append), 0);
    }

    #[test]
    fn same_group_runs_together() {
        let mut arena = CommandArena::new();
        let a = arena.add(request("a1", Command::Noop));
        let b = arena.add(request("a2", Command::Capability));
        let c = arena.add(request("a3", Command::Select));

        let block = arena.start_block();
        assert_eq!(block, vec![a, b]);
        // The group-0 command blocks behind the running pair.
        assert_eq!(arena.get(c).unwrap().state, CommandState::Blocked);

        arena.set_state(a, CommandState::Finished);
        arena.set_state(b, CommandState::Finished);
        arena.emit_responses();
        let block = arena.start_block();
        assert_eq!(block, vec![c]);
    }

    #[test]
    fn group_zero_runs_alone() {
        let mut arena = CommandArena::new();
        let a = arena.add(request("a1", Command::Select));
        let b = arena.add(request("a2", Command::Select));
        let block = arena.start_block();
        assert_eq!(block, vec![a]);
        // The second one just waits its turn.
        assert_eq!(arena.get(b).unwrap().state, CommandState::Unparsed);
        arena.set_state(a, CommandState::Finished);
        arena.emit_responses();
        assert_eq!(arena.start_block(), vec![b]);
    }

    #[test]
    fn emission_halts_at_unfinished_command() {
        let mut arena = CommandArena::new();
        let a = arena.add(request("a1", Command::List));
        let b = arena.add(request("a2", Command::Lsub));
        arena.start_block();

        // a2 finishes first; its response must wait for a1.
        arena.respond(b, b"a2 OK done\r\n".to_vec());
        arena.set_state(b, CommandState::Finished);
        assert!(arena.emit_responses().is_empty());

        arena.respond(a, b"* LIST () \"/\" INBOX\r\n".to_vec());
        arena.respond(a, b"a1 OK done\r\n".to_vec());
        arena.set_state(a, CommandState::Finished);
        let out = arena.emit_responses();
        assert_eq!(
            out,
            vec![
                b"* LIST () \"/\" INBOX\r\n".to_vec(),
                b"a1 OK done\r\n".to_vec(),
                b"a2 OK done\r\n".to_vec(),
            ]
        );
    }

    #[test]
    fn error_responses_jump_the_queue() {
        let mut arena = CommandArena::new();
        let a = arena.add(request("a1", Command::List));
        let b = arena.add(request("a2", Command::Lsub));
        arena.start_block();

        arena.respond(b, b"a2 BAD no such thing\r\n".to_vec());
        arena.set_failed(b);
        arena.set_state(b, CommandState::Finished);
        let out = arena.emit_responses();
        assert_eq!(out, vec![b"a2 BAD no such thing\r\n".to_vec()]);
        let _ = a;
    }
}
