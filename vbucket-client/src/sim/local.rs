//! In-process connections to simulated nodes, bypassing TCP.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use super::node::NodeState;
use crate::{
    connection::{AuthContext, Connector, EventSender, LinkState, NodeConnection},
    error::ConnectionError,
    protocol::Request,
    topology::NodeId,
};

#[derive(Clone)]
pub struct LocalConnector {
    nodes: Arc<HashMap<NodeId, Arc<NodeState>>>,
    auth: AuthContext,
}

impl LocalConnector {
    pub fn new(nodes: impl IntoIterator<Item = Arc<NodeState>>, auth: AuthContext) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|state| (state.id().clone(), state))
            .collect();
        Self {
            nodes: Arc::new(nodes),
            auth,
        }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        node: &NodeId,
        generation: u64,
        events: EventSender,
    ) -> Result<Arc<dyn NodeConnection>, ConnectionError> {
        let refused = |reason: &str| ConnectionError::Connect {
            node: node.to_string(),
            reason: reason.to_string(),
        };
        let state = self.nodes.get(node).ok_or_else(|| refused("no such node"))?;
        if !state.is_up() {
            return Err(refused("connection refused"));
        }
        state
            .authenticate(&self.auth.bucket, &self.auth.password)
            .map_err(|reason| ConnectionError::Auth {
                node: node.to_string(),
                reason,
            })?;

        Ok(Arc::new(LocalConnection {
            link: LinkState::new(node.clone(), generation, events),
            state: Arc::clone(state),
        }))
    }
}

struct LocalConnection {
    link: Arc<LinkState>,
    state: Arc<NodeState>,
}

#[async_trait]
impl NodeConnection for LocalConnection {
    fn node(&self) -> &NodeId {
        self.link.node()
    }

    fn generation(&self) -> u64 {
        self.link.generation()
    }

    fn is_live(&self) -> bool {
        self.link.is_live() && self.state.is_up()
    }

    async fn send(&self, request: Request) -> Result<(), ConnectionError> {
        if !self.state.is_up() {
            self.link.shut("node stopped");
        }
        if !self.link.is_live() {
            return Err(ConnectionError::Closed {
                node: self.link.node().to_string(),
            });
        }
        let response = self.state.execute(request);
        self.link.deliver(response);
        Ok(())
    }

    fn close(&self) {
        self.link.shut("closed by client");
    }
}
