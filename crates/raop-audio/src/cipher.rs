//! RTP packet decryption.
//!
//! RAOP encrypts each audio payload independently with AES-128-CBC, restarting
//! the chain from the session IV for every packet.

use crate::rtp::RtpPacket;
use crate::AudioFrame;
use raop_core::error::Result;
use raop_crypto::aes::AesCbcCipher;

/// Trait for decrypting RTP audio payloads.
pub trait PacketCipher: Send + Sync {
    /// Decrypt an audio payload in place.
    fn decrypt_payload(&self, payload: &mut [u8]) -> Result<()>;

    /// Parse an audio packet and decrypt its payload.
    fn open(&self, data: &[u8]) -> Result<AudioFrame> {
        let RtpPacket { header, mut payload } = RtpPacket::parse_audio(data)?;
        self.decrypt_payload(&mut payload)?;
        Ok(AudioFrame::new(header.sequence, header.timestamp, payload))
    }
}

/// AES-128-CBC cipher for AirPlay 1 audio.
#[derive(Debug, Clone)]
pub struct AesPacketCipher {
    cipher: AesCbcCipher,
}

impl AesPacketCipher {
    pub fn new(cipher: AesCbcCipher) -> Self {
        Self { cipher }
    }
}

impl PacketCipher for AesPacketCipher {
    fn decrypt_payload(&self, payload: &mut [u8]) -> Result<()> {
        self.cipher.decrypt_raop_in_place(payload)?;
        Ok(())
    }
}
