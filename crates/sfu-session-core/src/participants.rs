use serde::{Deserialize, Deserializer, Serialize};

/// Decode a field, reading an explicit `null` as the type's default.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A room member as reported by the server roster events.
///
/// Servers send `null` for unset fields; those decode as defaults so one
/// sparse member never drops the whole roster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Participant {
    pub id: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    pub islevel: Option<String>,
    #[serde(rename = "audioID", deserialize_with = "null_as_default")]
    pub audio_id: String,
    #[serde(rename = "videoID", deserialize_with = "null_as_default")]
    pub video_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub muted: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_banned: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_suspended: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub video_on: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub audio_on: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub use_board: bool,
    pub break_room: Option<i32>,
}

impl Participant {
    pub fn is_host(&self) -> bool {
        self.islevel.as_deref() == Some("2")
    }
}

/// A pending media/chat permission request raised by a participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub icon: String,
    pub name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitingParticipant {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoHostResponsibility {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub value: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub dedicated: bool,
}

/// Participants, waiting room, requests and co-host assignment.
///
/// Updated by the event reducer. Read by native UI layers.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    participants: Vec<Participant>,
    participants_all: Vec<Participant>,
    requests: Vec<Request>,
    waiting: Vec<WaitingParticipant>,
    co_host: String,
    co_host_responsibilities: Vec<CoHostResponsibility>,
    pending_count: usize,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster from an `allMembers`/`allMembersRest` push.
    ///
    /// `participants` excludes banned and suspended members. With
    /// `active_only` the full list is filtered too. Requests from members
    /// no longer present are dropped. An omitted or blank co-host keeps the
    /// previously known value.
    pub fn apply_members(
        &mut self,
        members: Vec<Participant>,
        requests: Vec<Request>,
        co_host: Option<String>,
        responsibilities: Option<Vec<CoHostResponsibility>>,
        active_only: bool,
    ) {
        let active: Vec<Participant> = members
            .iter()
            .filter(|p| !p.is_banned && !p.is_suspended)
            .cloned()
            .collect();
        self.participants_all = if active_only { active.clone() } else { members };
        self.participants = active;

        self.requests = requests
            .into_iter()
            .filter(|r| {
                self.participants
                    .iter()
                    .any(|p| p.id.as_deref() == Some(r.id.as_str()))
            })
            .collect();
        self.recount();
        self.update_co_host(co_host, responsibilities);
    }

    /// Returns true when the co-host value changed.
    pub fn update_co_host(
        &mut self,
        co_host: Option<String>,
        responsibilities: Option<Vec<CoHostResponsibility>>,
    ) -> bool {
        let mut changed = false;
        if let Some(name) = co_host.filter(|c| !c.trim().is_empty()) {
            changed = name != self.co_host;
            self.co_host = name;
        }
        if let Some(res) = responsibilities {
            self.co_host_responsibilities = res;
        }
        changed
    }

    pub fn set_waiting(&mut self, waiting: Vec<WaitingParticipant>) {
        self.waiting = waiting;
        self.recount();
    }

    /// A participant entered the waiting room before the full list arrived.
    pub fn note_waiting(&mut self) {
        self.pending_count += 1;
    }

    pub fn add_request(&mut self, request: Request) {
        self.requests.push(request);
        self.recount();
    }

    pub fn remove_request(&mut self, id: &str) -> Option<Request> {
        let idx = self.requests.iter().position(|r| r.id == id)?;
        let removed = self.requests.remove(idx);
        self.recount();
        Some(removed)
    }

    /// Remove a banned participant by name.
    pub fn remove_by_name(&mut self, name: &str) -> bool {
        let before = self.participants.len() + self.participants_all.len();
        self.participants.retain(|p| p.name != name);
        self.participants_all.retain(|p| p.name != name);
        before != self.participants.len() + self.participants_all.len()
    }

    pub fn participant(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    pub fn participant_mut(&mut self, name: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.name == name)
    }

    /// Apply `update` to the member named `name`, or owning `producer_id`
    /// when no name is given, in both lists. Returns true if one matched.
    pub fn update_member(
        &mut self,
        name: &str,
        producer_id: &str,
        update: impl Fn(&mut Participant),
    ) -> bool {
        let matches = |p: &Participant| {
            if name.is_empty() {
                !producer_id.is_empty() && (p.audio_id == producer_id || p.video_id == producer_id)
            } else {
                p.name == name
            }
        };
        let mut found = false;
        for p in self.participants.iter_mut().chain(self.participants_all.iter_mut()) {
            if matches(p) {
                update(p);
                found = true;
            }
        }
        found
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participants_all(&self) -> &[Participant] {
        &self.participants_all
    }

    pub fn set_participants(&mut self, participants: Vec<Participant>) {
        self.participants = participants;
    }

    /// Host-side member refresh carried by breakout updates.
    ///
    /// Unlike [`Roster::apply_members`] only banned members are hidden and
    /// requests are left alone.
    pub fn replace_members(&mut self, members: Vec<Participant>) {
        self.participants = members.iter().filter(|p| !p.is_banned).cloned().collect();
        self.participants_all = members;
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn waiting(&self) -> &[WaitingParticipant] {
        &self.waiting
    }

    pub fn co_host(&self) -> &str {
        &self.co_host
    }

    pub fn co_host_responsibilities(&self) -> &[CoHostResponsibility] {
        &self.co_host_responsibilities
    }

    /// Whether `member` is the co-host and holds the named responsibility.
    pub fn co_host_can(&self, member: &str, responsibility: &str) -> bool {
        !self.co_host.is_empty()
            && self.co_host == member
            && self
                .co_host_responsibilities
                .iter()
                .any(|r| r.name == responsibility && r.value)
    }

    pub fn host(&self) -> Option<&Participant> {
        self.participants.iter().find(|p| p.is_host())
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.participants_all
            .iter()
            .any(|p| p.name == name && p.is_banned)
    }

    /// `waiting + requests`.
    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    fn recount(&mut self) {
        self.pending_count = self.waiting.len() + self.requests.len();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
