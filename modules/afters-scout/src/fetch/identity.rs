/// A request identity: the user agent and optional proxy a fetch goes out with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Rotation slot this identity was taken from.
    pub slot: usize,
    pub user_agent: String,
    pub proxy: Option<String>,
}

/// Fixed set of user agents and proxies, addressed by a venue's rotation index.
///
/// User agents and proxies cycle independently so every combination is
/// eventually tried when the lists have coprime lengths.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    user_agents: Vec<String>,
    proxies: Vec<String>,
}

const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (compatible; afters-scout/0.1)";

impl IdentityPool {
    pub fn new(user_agents: Vec<String>, proxies: Vec<String>) -> Self {
        let user_agents = if user_agents.is_empty() {
            vec![FALLBACK_USER_AGENT.to_string()]
        } else {
            user_agents
        };
        Self {
            user_agents,
            proxies,
        }
    }

    /// Number of distinct identities before rotation repeats.
    pub fn len(&self) -> usize {
        let proxies = self.proxies.len().max(1);
        lcm(self.user_agents.len(), proxies)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn identity(&self, rotation_index: usize) -> Identity {
        let user_agent = self.user_agents[rotation_index % self.user_agents.len()].clone();
        let proxy = if self.proxies.is_empty() {
            None
        } else {
            Some(self.proxies[rotation_index % self.proxies.len()].clone())
        };
        Identity {
            slot: rotation_index % self.len(),
            user_agent,
            proxy,
        }
    }

    pub fn user_agents(&self) -> &[String] {
        &self.user_agents
    }

    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}
