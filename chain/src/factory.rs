// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed constructors for signed trxs.
//!
//! Payloads are encrypted before signing: with the group cipher key, or,
//! for POST in private groups, sealed to the announced user keys. REQ
//! trxs carry nonce 0; everything else takes the next chain nonce.

use std::sync::Arc;

use grove_keys::{aes_encode, AccountKeystore};
use grove_storage::ChainStorage;
use grove_types::{
    now_ts, AnnounceItem, AppConfigItem, Block, BlocksBundle, ChainConfigItem, ChainError,
    GroveResult, MessageCodec, ProducerBundle, ReqBlkResult, ReqBlock, ReqBlockResp, Trx, TrxType,
    UserItem, TRX_DATA_LIMIT,
};

/// Nonce-table role for user-submitted trxs.
const CHAIN_NONCE_ROLE: &str = "chain";

pub struct TrxFactory {
    group_id: String,
    version: String,
    sign_pubkey: String,
    cipher_key: [u8; 32],
    storage: Arc<ChainStorage>,
    keystore: Arc<dyn AccountKeystore>,
}

impl TrxFactory {
    pub fn new(
        group_id: &str,
        version: &str,
        sign_pubkey: &str,
        cipher_key: [u8; 32],
        storage: Arc<ChainStorage>,
        keystore: Arc<dyn AccountKeystore>,
    ) -> Self {
        Self {
            group_id: group_id.to_string(),
            version: version.to_string(),
            sign_pubkey: sign_pubkey.to_string(),
            cipher_key,
            storage,
            keystore,
        }
    }

    /// Encrypt, assemble, and sign one trx.
    async fn new_trx(
        &self,
        trx_type: TrxType,
        data: &[u8],
        nonce: u64,
        encrypt_to: Option<&[String]>,
    ) -> GroveResult<Trx> {
        let sealed = match encrypt_to {
            Some(recipients) => self.keystore.encrypt_to(recipients, data).await?,
            None => aes_encode(&self.cipher_key, data)?,
        };

        let mut trx = Trx {
            trx_id: uuid::Uuid::new_v4().to_string(),
            group_id: self.group_id.clone(),
            trx_type,
            data: sealed,
            nonce,
            timestamp: now_ts(),
            version: self.version.clone(),
            sender_pubkey: self.sign_pubkey.clone(),
            sender_sign: Vec::new(),
        };
        let hash = trx.hash_bytes()?;
        trx.sender_sign = self.keystore.sign(&self.group_id, &hash).await?;
        Ok(trx)
    }

    async fn next_nonce(&self) -> GroveResult<u64> {
        self.storage.next_nonce(&self.group_id, CHAIN_NONCE_ROLE).await
    }

    /// POST with opaque content. `encrypt_to` carries the announced user
    /// keys of a private group.
    pub async fn post_trx(
        &self,
        content: &[u8],
        encrypt_to: Option<&[String]>,
    ) -> GroveResult<Trx> {
        if content.len() > TRX_DATA_LIMIT {
            return Err(ChainError::InvalidData(format!(
                "content size over {} bytes",
                TRX_DATA_LIMIT
            )));
        }
        let nonce = self.next_nonce().await?;
        self.new_trx(TrxType::Post, content, nonce, encrypt_to).await
    }

    pub async fn announce_trx(&self, item: &AnnounceItem) -> GroveResult<Trx> {
        let nonce = self.next_nonce().await?;
        self.new_trx(TrxType::Announce, &MessageCodec::encode_to_vec(item)?, nonce, None)
            .await
    }

    pub async fn user_trx(&self, item: &UserItem) -> GroveResult<Trx> {
        let nonce = self.next_nonce().await?;
        self.new_trx(TrxType::User, &MessageCodec::encode_to_vec(item)?, nonce, None)
            .await
    }

    pub async fn producer_trx(&self, bundle: &ProducerBundle) -> GroveResult<Trx> {
        let nonce = self.next_nonce().await?;
        self.new_trx(
            TrxType::Producer,
            &MessageCodec::encode_to_vec(bundle)?,
            nonce,
            None,
        )
        .await
    }

    pub async fn app_config_trx(&self, item: &AppConfigItem) -> GroveResult<Trx> {
        let nonce = self.next_nonce().await?;
        self.new_trx(
            TrxType::AppConfig,
            &MessageCodec::encode_to_vec(item)?,
            nonce,
            None,
        )
        .await
    }

    pub async fn chain_config_trx(&self, item: &ChainConfigItem) -> GroveResult<Trx> {
        let nonce = self.next_nonce().await?;
        self.new_trx(
            TrxType::ChainConfig,
            &MessageCodec::encode_to_vec(item)?,
            nonce,
            None,
        )
        .await
    }

    /// Sync request: blocks after `from_block`.
    pub async fn req_blocks_trx(&self, from_block: u64, blks_requested: u32) -> GroveResult<Trx> {
        let req = ReqBlock {
            group_id: self.group_id.clone(),
            from_block,
            blks_requested,
            req_pubkey: self.sign_pubkey.clone(),
        };
        self.new_trx(
            TrxType::ReqBlock,
            &MessageCodec::encode_to_vec(&req)?,
            0,
            None,
        )
        .await
    }

    /// Provider answer to a sync request.
    pub async fn req_blocks_resp_trx(
        &self,
        requester: &str,
        from_block: u64,
        blks_requested: u32,
        blocks: Vec<Block>,
        result: ReqBlkResult,
    ) -> GroveResult<Trx> {
        let resp = ReqBlockResp {
            group_id: self.group_id.clone(),
            requester_pubkey: requester.to_string(),
            provider_pubkey: self.sign_pubkey.clone(),
            result,
            from_block,
            blks_requested,
            blks_provided: blocks.len() as u32,
            blocks: BlocksBundle { blocks },
        };
        self.new_trx(
            TrxType::ReqBlockResp,
            &MessageCodec::encode_to_vec(&resp)?,
            0,
            None,
        )
        .await
    }
}
