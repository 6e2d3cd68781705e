use crate::node_id::NodeId;

use crossbeam::channel::Sender;

/// Fire-and-forget sink for committed edits. After every successful edit the freshly minted
/// layer-2 IDs are handed to the sink; delivery failures are logged and never fail the edit.
pub trait EditSink: Send + Sync {
    fn publish_edit(&self, table_id: &str, new_lvl2_ids: &[NodeId]);
}

/// What downstream consumers (meshing, analytics) receive per edit.
#[derive(Clone, Debug)]
pub struct EditNotice {
    pub table_id: String,
    pub new_lvl2_ids: Vec<NodeId>,
}

/// Publishes onto a crossbeam channel, the in-process stand-in for a message bus exchange.
pub struct ChannelSink {
    sender: Sender<EditNotice>,
}

impl ChannelSink {
    pub fn new(sender: Sender<EditNotice>) -> Self {
        Self { sender }
    }
}

impl EditSink for ChannelSink {
    fn publish_edit(&self, table_id: &str, new_lvl2_ids: &[NodeId]) {
        let notice = EditNotice {
            table_id: table_id.to_owned(),
            new_lvl2_ids: new_lvl2_ids.to_vec(),
        };
        if let Err(err) = self.sender.try_send(notice) {
            log::warn!("dropping edit notice for table {table_id}: {err}");
        }
    }
}

/// Discards all notices; the default sink.
pub struct NullSink;

impl EditSink for NullSink {
    fn publish_edit(&self, _table_id: &str, _new_lvl2_ids: &[NodeId]) {}
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
