//! Typed queries.
//!
//! Each query encodes its argument, sends it with the configured expire
//! time, and decodes the reply with Bitcoin consensus encoding.

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::Decodable;
use bitcoin::{BlockHash, Transaction, Txid};
use bytes::Bytes;

use crate::client::Client;
use crate::codec::ConsensusCodec;
use crate::error::Result;
use crate::protocol::Command;

impl Client {
    /// Height of the server's current chain tip.
    pub async fn last_height(&self) -> Result<u32> {
        self.query(Command::LastHeight, Bytes::new()).await
    }

    /// Number of peers the server's node is connected to.
    pub async fn total_connections(&self) -> Result<u32> {
        self.query(Command::TotalConnections, Bytes::new()).await
    }

    /// Header of the block at `height`.
    pub async fn block_header(&self, height: u32) -> Result<BlockHeader> {
        self.query(Command::BlockHeader, ConsensusCodec::encode(&height))
            .await
    }

    /// Height of the block with `hash`.
    pub async fn block_height(&self, hash: &BlockHash) -> Result<u32> {
        self.query(Command::BlockHeight, ConsensusCodec::encode(hash))
            .await
    }

    /// Confirmed or mempool transaction with `txid`.
    pub async fn transaction(&self, txid: &Txid) -> Result<Transaction> {
        self.query(Command::Transaction, ConsensusCodec::encode(txid))
            .await
    }

    async fn query<T: Decodable>(&self, command: Command, payload: Bytes) -> Result<T> {
        let reply = self.call(command, payload).await?;
        ConsensusCodec::decode_reply(command, &reply)
    }
}
