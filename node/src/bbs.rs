//! Bulletin-board relay: store-and-forward messages with channel
//! subscriptions and expiry.

use std::collections::HashMap;

use shroud_messages::{
    BbsGetMsgBody, BbsHaveMsgBody, BbsMsgBody, BbsSubscribeMsg, WireMessage,
};
use shroud_store::BbsRecord;
use shroud_types::MsgKey;

use crate::error::Violation;
use crate::node::NodeCore;
use crate::peer::PeerRef;

/// Subscription table and cleanup bookkeeping.
#[derive(Default)]
pub struct BbsState {
    /// Channel -> subscribed sessions.
    pub subscriptions: HashMap<u32, Vec<PeerRef>>,
    pub last_cleanup_ms: u64,
    pub recommended_channel: u32,
}

/// Message key: `H(payload || channel)`.
pub fn calc_msg_key(payload: &[u8], channel: u32) -> MsgKey {
    MsgKey::new(shroud_crypto::blake2b_256_multi(&[
        payload,
        &channel.to_be_bytes(),
    ]))
}

impl NodeCore {
    pub(crate) fn on_bbs_msg(&mut self, p: PeerRef, msg: BbsMsgBody) -> Result<(), Violation> {
        let now_s = self.now_ms / 1000;
        let oldest = now_s.saturating_sub(self.cfg.timeout.bbs_message_timeout_s);
        let newest = now_s + self.cfg.timeout.bbs_message_max_ahead_s;
        if msg.time_posted <= oldest || msg.time_posted > newest {
            return Ok(()); // outside the acceptance window, ignore
        }

        let key = calc_msg_key(&msg.payload, msg.channel);
        match self.stores.bbs.contains(&key) {
            Ok(true) => return Ok(()), // already have it
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "bbs lookup failed");
                return Ok(());
            }
        }

        self.bbs_maybe_cleanup();

        let record = BbsRecord {
            key,
            channel: msg.channel,
            time_posted: msg.time_posted,
            payload: msg.payload.clone(),
        };
        match self.stores.bbs.insert(&record) {
            Ok(true) => {}
            Ok(false) => return Ok(()), // racer won
            Err(e) => {
                tracing::warn!(error = %e, "bbs insert failed");
                return Ok(());
            }
        }
        self.wanted_bbs.delete(&key);

        // 1. Announce to other bbs-capable peers.
        for peer in self.peers.refs() {
            if peer == p || !self.peers.get(peer).config.bbs {
                continue;
            }
            self.send(peer, WireMessage::BbsHaveMsg(BbsHaveMsgBody { key }));
        }

        // 2. Push the full message to local subscribers.
        let subscribers = self
            .bbs
            .subscriptions
            .get(&msg.channel)
            .cloned()
            .unwrap_or_default();
        for peer in subscribers {
            if peer == p {
                continue;
            }
            self.send(peer, WireMessage::BbsMsg(msg.clone()));
        }
        Ok(())
    }

    pub(crate) fn on_bbs_have_msg(
        &mut self,
        p: PeerRef,
        msg: BbsHaveMsgBody,
    ) -> Result<(), Violation> {
        match self.stores.bbs.contains(&msg.key) {
            Ok(true) => return Ok(()), // already have it
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "bbs lookup failed");
                return Ok(());
            }
        }
        if !self.wanted_bbs.add(msg.key, self.now_ms) {
            return Ok(()); // already waiting for it
        }
        self.send(p, WireMessage::BbsGetMsg(BbsGetMsgBody { key: msg.key }));
        Ok(())
    }

    pub(crate) fn on_bbs_get_msg(
        &mut self,
        p: PeerRef,
        msg: BbsGetMsgBody,
    ) -> Result<(), Violation> {
        let record = match self.stores.bbs.get(&msg.key) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()), // don't have it
            Err(e) => {
                tracing::warn!(error = %e, "bbs fetch failed");
                return Ok(());
            }
        };
        self.send_bbs_record(p, &record);
        Ok(())
    }

    pub(crate) fn on_bbs_subscribe(
        &mut self,
        p: PeerRef,
        msg: BbsSubscribeMsg,
    ) -> Result<(), Violation> {
        let subscribed = self.peers.get(p).subscriptions.contains(&msg.channel);
        if subscribed == msg.on {
            return Ok(()); // no state change
        }

        if msg.on {
            self.peers.get_mut(p).subscriptions.insert(msg.channel);
            self.bbs.subscriptions.entry(msg.channel).or_default().push(p);

            let backfill = match self.stores.bbs.enum_channel(msg.channel, msg.time_from) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(error = %e, "bbs backfill failed");
                    return Ok(());
                }
            };
            for record in backfill {
                self.send_bbs_record(p, &record);
            }
        } else {
            self.unsubscribe(p, msg.channel);
        }
        Ok(())
    }

    fn send_bbs_record(&mut self, p: PeerRef, record: &BbsRecord) {
        self.send(
            p,
            WireMessage::BbsMsg(BbsMsgBody {
                channel: record.channel,
                time_posted: record.time_posted,
                payload: record.payload.clone(),
            }),
        );
    }

    fn unsubscribe(&mut self, p: PeerRef, channel: u32) {
        self.peers.get_mut(p).subscriptions.remove(&channel);
        if let Some(subs) = self.bbs.subscriptions.get_mut(&channel) {
            subs.retain(|&peer| peer != p);
            if subs.is_empty() {
                self.bbs.subscriptions.remove(&channel);
            }
        }
    }

    /// Drop every channel subscription a dying session holds.
    pub fn unsubscribe_all(&mut self, p: PeerRef) {
        let channels: Vec<u32> = self.peers.get(p).subscriptions.iter().copied().collect();
        for channel in channels {
            self.unsubscribe(p, channel);
        }
    }

    /// Prune expired messages and re-derive the recommended channel; rate
    /// limited by `bbs_cleanup_period_ms`.
    pub fn bbs_maybe_cleanup(&mut self) {
        let dt = self.now_ms.saturating_sub(self.bbs.last_cleanup_ms);
        if dt >= self.cfg.timeout.bbs_cleanup_period_ms {
            self.bbs_cleanup();
        }
    }

    pub fn bbs_cleanup(&mut self) {
        let cutoff = (self.now_ms / 1000).saturating_sub(self.cfg.timeout.bbs_message_timeout_s);
        match self.stores.bbs.delete_older_than(cutoff) {
            Ok(n) if n > 0 => tracing::debug!(pruned = n, "bbs cleanup"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "bbs cleanup failed"),
        }
        self.bbs.last_cleanup_ms = self.now_ms;
        self.find_recommended_channel();
    }

    /// The smallest attractive channel: the fullest one still at or under
    /// the ideal population, or the first unpopulated gap.
    pub fn find_recommended_channel(&mut self) {
        let populations = match self.stores.bbs.channel_populations() {
            Ok(populations) => populations,
            Err(e) => {
                tracing::warn!(error = %e, "bbs population scan failed");
                return;
            }
        };
        let ideal = self.cfg.bbs_ideal_channel_population;

        let mut best: Option<(u32, u32)> = None; // (count, channel)
        let mut gap: Option<u32> = None;
        let mut expect = 0u32;
        for (channel, count) in &populations {
            if *channel > expect && gap.is_none() {
                gap = Some(expect);
            }
            expect = channel + 1;
            if *count <= ideal && best.map_or(true, |(c, _)| c < *count) {
                best = Some((*count, *channel));
            }
        }
        let gap = gap.unwrap_or(expect);

        self.bbs.recommended_channel = match best {
            Some((_, channel)) => channel,
            None => gap,
        };
    }
}
