use std::collections::HashMap;
use std::sync::Arc;

use relay_core::events::USER_AUTHOR;
use relay_core::model::Model;

use crate::agents::Agent;
use crate::error::EngineError;

/// Name index over an agent hierarchy with parent links.
///
/// Agents do not know their parents; every upward lookup goes through the tree.
pub struct AgentTree {
    root: Arc<dyn Agent>,
    agents: HashMap<String, Arc<dyn Agent>>,
    parents: HashMap<String, String>,
}

impl AgentTree {
    /// Indexes `root` and its descendants. Names must be unique, non-empty and not `"user"`.
    pub fn new(root: Arc<dyn Agent>) -> Result<Self, EngineError> {
        let mut tree = Self {
            root: Arc::clone(&root),
            agents: HashMap::new(),
            parents: HashMap::new(),
        };
        let mut pending = vec![(root, None::<String>)];
        while let Some((agent, parent)) = pending.pop() {
            let name = agent.name().to_string();
            if name.is_empty() || name == USER_AUTHOR {
                return Err(EngineError::Configuration(format!(
                    "invalid agent name {name:?}"
                )));
            }
            if tree.agents.contains_key(&name) {
                return Err(EngineError::Configuration(format!(
                    "duplicate agent name {name}"
                )));
            }
            for sub in agent.sub_agents() {
                pending.push((Arc::clone(sub), Some(name.clone())));
            }
            if let Some(parent) = parent {
                tree.parents.insert(name.clone(), parent);
            }
            tree.agents.insert(name, agent);
        }
        Ok(tree)
    }

    pub fn root(&self) -> &Arc<dyn Agent> {
        &self.root
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn parent_of(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.parents.get(name).and_then(|p| self.find(p))
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<dyn Agent>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Whether a new user turn may resume at `name` instead of the root: every
    /// agent from `name` up to the root is an `LlmAgent` that allows transfer
    /// back to its parent.
    pub fn is_transferable(&self, name: &str) -> bool {
        let mut current = name.to_string();
        loop {
            let Some(llm) = self.agents.get(&current).and_then(|a| a.as_llm()) else {
                return false;
            };
            if llm.disallow_transfer_to_parent() {
                return false;
            }
            match self.parents.get(&current) {
                Some(parent) => current = parent.clone(),
                None => return true,
            }
        }
    }

    /// Agents an `LlmAgent` named `name` may hand control to. The parent and
    /// peers only count when the parent is itself an `LlmAgent`.
    pub fn transfer_targets(&self, name: &str) -> Vec<Arc<dyn Agent>> {
        let Some(agent) = self.find(name) else {
            return Vec::new();
        };
        let mut targets: Vec<Arc<dyn Agent>> = agent.sub_agents().to_vec();
        let Some(llm) = agent.as_llm() else {
            return targets;
        };
        let Some(parent) = self.parent_of(name).filter(|p| p.as_llm().is_some()) else {
            return targets;
        };
        if !llm.disallow_transfer_to_parent() {
            targets.push(Arc::clone(&parent));
        }
        if !llm.disallow_transfer_to_peers() {
            targets.extend(
                parent
                    .sub_agents()
                    .iter()
                    .filter(|peer| peer.name() != name)
                    .cloned(),
            );
        }
        targets
    }

    /// The model of `name` or of its nearest `LlmAgent` ancestor that has one.
    pub fn model_for(&self, name: &str) -> Option<Arc<dyn Model>> {
        let mut current = Some(name.to_string());
        while let Some(agent_name) = current {
            if let Some(model) = self
                .agents
                .get(&agent_name)
                .and_then(|a| a.as_llm())
                .and_then(|llm| llm.model())
            {
                return Some(model);
            }
            current = self.parents.get(&agent_name).cloned();
        }
        None
    }

    /// Fails with `Configuration` when an `LlmAgent` has no model to use.
    pub fn validate_models(&self) -> Result<(), EngineError> {
        let mut missing: Vec<&str> = self
            .agents
            .iter()
            .filter(|(name, agent)| agent.as_llm().is_some() && self.model_for(name).is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        Err(EngineError::Configuration(format!(
            "no model configured for agents: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::llm::LlmAgent;
    use crate::agents::sequential::SequentialAgent;
    use relay_llm::MockModel;

    fn llm(name: &str) -> LlmAgent {
        LlmAgent::builder(name).build()
    }

    fn model() -> Arc<dyn Model> {
        Arc::new(MockModel::new("mock", vec![]))
    }

    #[test]
    fn indexes_parents() {
        let child: Arc<dyn Agent> = Arc::new(llm("child"));
        let root: Arc<dyn Agent> = Arc::new(LlmAgent::builder("root").sub_agent(child).build());
        let tree = AgentTree::new(root).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.parent_of("child").unwrap().name(), "root");
        assert!(tree.parent_of("root").is_none());
        assert!(tree.find("missing").is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let root: Arc<dyn Agent> = Arc::new(SequentialAgent::new(
            "root",
            vec![Arc::new(llm("a")), Arc::new(llm("a"))],
        ));
        assert!(matches!(
            AgentTree::new(root),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn user_is_reserved() {
        let root: Arc<dyn Agent> = Arc::new(llm(USER_AUTHOR));
        assert!(AgentTree::new(root).is_err());
    }

    #[test]
    fn transferable_chain_requires_llm_agents() {
        let leaf: Arc<dyn Agent> = Arc::new(llm("leaf"));
        let pinned: Arc<dyn Agent> = Arc::new(
            LlmAgent::builder("pinned")
                .disallow_transfer_to_parent(true)
                .build(),
        );
        let root: Arc<dyn Agent> = Arc::new(
            LlmAgent::builder("root")
                .sub_agent(leaf)
                .sub_agent(pinned)
                .build(),
        );
        let tree = AgentTree::new(root).unwrap();
        assert!(tree.is_transferable("leaf"));
        assert!(!tree.is_transferable("pinned"));

        let under_seq: Arc<dyn Agent> = Arc::new(llm("worker"));
        let seq: Arc<dyn Agent> = Arc::new(SequentialAgent::new("seq", vec![under_seq]));
        let tree = AgentTree::new(seq).unwrap();
        assert!(!tree.is_transferable("worker"));
    }

    #[test]
    fn transfer_targets_respect_flags() {
        let a: Arc<dyn Agent> = Arc::new(llm("a"));
        let b: Arc<dyn Agent> = Arc::new(
            LlmAgent::builder("b")
                .disallow_transfer_to_peers(true)
                .build(),
        );
        let root: Arc<dyn Agent> = Arc::new(LlmAgent::builder("root").sub_agent(a).sub_agent(b).build());
        let tree = AgentTree::new(root).unwrap();

        let names = |name: &str| -> Vec<String> {
            let mut n: Vec<String> = tree
                .transfer_targets(name)
                .iter()
                .map(|a| a.name().to_string())
                .collect();
            n.sort();
            n
        };
        assert_eq!(names("root"), vec!["a", "b"]);
        assert_eq!(names("a"), vec!["b", "root"]);
        assert_eq!(names("b"), vec!["root"]);
    }

    #[test]
    fn workflow_parent_offers_no_transfer() {
        let a: Arc<dyn Agent> = Arc::new(llm("a"));
        let b: Arc<dyn Agent> = Arc::new(llm("b"));
        let seq: Arc<dyn Agent> = Arc::new(SequentialAgent::new("seq", vec![a, b]));
        let tree = AgentTree::new(seq).unwrap();
        assert!(tree.transfer_targets("a").is_empty());
        assert_eq!(tree.transfer_targets("seq").len(), 2);
    }

    #[test]
    fn model_inherited_from_ancestor() {
        let child: Arc<dyn Agent> = Arc::new(llm("child"));
        let root: Arc<dyn Agent> = Arc::new(
            LlmAgent::builder("root")
                .model(model())
                .sub_agent(child)
                .build(),
        );
        let tree = AgentTree::new(root).unwrap();
        assert_eq!(tree.model_for("child").unwrap().name(), "mock");
        assert!(tree.validate_models().is_ok());
    }

    #[test]
    fn missing_model_is_configuration_error() {
        let root: Arc<dyn Agent> = Arc::new(SequentialAgent::new("seq", vec![Arc::new(llm("orphan"))]));
        let tree = AgentTree::new(root).unwrap();
        let err = tree.validate_models().unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }
}
