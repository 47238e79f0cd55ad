//! Streams and components.
//!
//! An agent owns media streams; each stream owns one component per
//! transport flow (classically rtp and rtcp).  Components own their
//! candidates, local and remote; the agent's check list pairs them.

use crate::candidate::Candidate;

pub struct Component {
    pub id: u16,
    pub locals: Vec<Candidate>,
    pub remotes: Vec<Candidate>,
}

impl Component {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            locals: Vec::new(),
            remotes: Vec::new(),
        }
    }

    /// highest-priority local candidate, used as the advertised
    /// default.
    pub fn default_candidate(&self) -> Option<&Candidate> {
        self.locals.iter().max_by_key(|it| it.priority)
    }
}

pub struct IceMediaStream {
    pub name: String,
    pub components: Vec<Component>,
}

impl IceMediaStream {
    pub fn new(name: &str, components: u16) -> Self {
        Self {
            name: name.to_string(),
            components: (1..=components.max(1)).map(Component::new).collect(),
        }
    }

    pub fn component(&self, id: u16) -> Option<&Component> {
        self.components.iter().find(|it| it.id == id)
    }

    pub fn component_mut(&mut self, id: u16) -> Option<&mut Component> {
        self.components.iter_mut().find(|it| it.id == id)
    }
}
