//! MSCHAPv2 challenge-response (RFC 2759), used for mutual-auth CHAP.

use alloc::string::String;
use alloc::vec::Vec;

use crate::cipher::BlockCipher;
use crate::des::{expand_key_7to8, Des};
use crate::digest::Digest;
use crate::md4::Md4;
use crate::sha1::Sha1;

/// "Magic server to client signing constant"
const MAGIC1: &[u8; 39] = b"Magic server to client signing constant";

/// "Pad to make it do more than one iteration"
const MAGIC2: &[u8; 41] = b"Pad to make it do more than one iteration";

/// ChallengeHash: first 8 bytes of SHA1(peer || authenticator || username)
pub fn challenge_hash(peer: &[u8; 16], authenticator: &[u8; 16], username: &str) -> [u8; 8] {
    let mut sha = Sha1::new();
    sha.update(peer);
    sha.update(authenticator);
    sha.update(username.as_bytes());
    let digest = sha.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// NtPasswordHash: MD4 over the UTF-16LE encoding of the password
pub fn nt_password_hash(password: &str) -> [u8; 16] {
    let mut utf16le = Vec::with_capacity(password.len() * 2);
    for unit in password.encode_utf16() {
        utf16le.extend_from_slice(&unit.to_le_bytes());
    }
    let mut md4 = Md4::new();
    md4.update(&utf16le);
    let digest = md4.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// ChallengeResponse: DES-encrypt the challenge hash under three 56-bit
/// keys cut from the zero-padded password hash
fn challenge_response(challenge: &[u8; 8], password_hash: &[u8; 16]) -> [u8; 24] {
    let mut z_password_hash = [0u8; 21];
    z_password_hash[..16].copy_from_slice(password_hash);

    let mut response = [0u8; 24];
    for i in 0..3 {
        let mut key7 = [0u8; 7];
        key7.copy_from_slice(&z_password_hash[i * 7..i * 7 + 7]);
        let key8 = expand_key_7to8(&key7);
        // Key expansion cannot fail for an 8-byte key
        if let Ok(des) = Des::new(&key8) {
            let mut block = *challenge;
            des.encrypt_block(&mut block);
            response[i * 8..i * 8 + 8].copy_from_slice(&block);
        }
    }
    response
}

/// GenerateNTResponse (RFC 2759 section 8.1)
pub fn nt_response(
    authenticator_challenge: &[u8; 16],
    peer_challenge: &[u8; 16],
    username: &str,
    password: &str,
) -> [u8; 24] {
    let challenge = challenge_hash(peer_challenge, authenticator_challenge, username);
    let password_hash = nt_password_hash(password);
    challenge_response(&challenge, &password_hash)
}

/// GenerateAuthenticatorResponse (RFC 2759 section 8.7), as the "S=..."
/// string the server must present
pub fn authenticator_response(
    password: &str,
    nt_response: &[u8; 24],
    peer_challenge: &[u8; 16],
    authenticator_challenge: &[u8; 16],
    username: &str,
) -> String {
    let password_hash = nt_password_hash(password);
    let mut md4 = Md4::new();
    md4.update(&password_hash);
    let password_hash_hash = md4.finalize();

    let mut sha = Sha1::new();
    sha.update(&password_hash_hash);
    sha.update(nt_response);
    sha.update(MAGIC1);
    let digest = sha.finalize();

    let challenge = challenge_hash(peer_challenge, authenticator_challenge, username);

    let mut sha = Sha1::new();
    sha.update(&digest);
    sha.update(&challenge);
    sha.update(MAGIC2);
    let final_digest = sha.finalize();

    let mut out = String::with_capacity(2 + 40);
    out.push_str("S=");
    for byte in final_digest {
        // Uppercase hex per the RFC's representation
        let hi = char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0');
        let lo = char::from_digit(u32::from(byte & 0xf), 16).unwrap_or('0');
        out.push(hi.to_ascii_uppercase());
        out.push(lo.to_ascii_uppercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_kernel::hex;

    // RFC 2759 section 9.2 test vector
    const USERNAME: &str = "User";
    const PASSWORD: &str = "clientPass";
    const AUTH_CHALLENGE: [u8; 16] = [
        0x5b, 0x5d, 0x7c, 0x7d, 0x7b, 0x3f, 0x2f, 0x3e,
        0x3c, 0x2c, 0x60, 0x21, 0x32, 0x26, 0x26, 0x28,
    ];
    const PEER_CHALLENGE: [u8; 16] = [
        0x16, 0x48, 0x40, 0x4f, 0x7e, 0x14, 0x7e, 0xff,
        0x3c, 0x4b, 0x2b, 0x21, 0x2e, 0x4f, 0x4f, 0x4e,
    ];

    #[test]
    fn challenge_hash_vector() {
        let hash = challenge_hash(&PEER_CHALLENGE, &AUTH_CHALLENGE, USERNAME);
        assert_eq!(hex::encode(&hash, ""), "d02e4386bce91226");
    }

    #[test]
    fn password_hash_vector() {
        let hash = nt_password_hash(PASSWORD);
        assert_eq!(
            hex::encode(&hash, ""),
            "44ebba8d5312b8d611474411f56989ae"
        );
    }

    #[test]
    fn nt_response_vector() {
        let response = nt_response(&AUTH_CHALLENGE, &PEER_CHALLENGE, USERNAME, PASSWORD);
        assert_eq!(
            hex::encode(&response, ""),
            "82309ecd8d708b5ea08faa3981cd83544233114a3d85d6df"
        );
    }

    #[test]
    fn authenticator_response_vector() {
        let response = nt_response(&AUTH_CHALLENGE, &PEER_CHALLENGE, USERNAME, PASSWORD);
        let auth = authenticator_response(
            PASSWORD,
            &response,
            &PEER_CHALLENGE,
            &AUTH_CHALLENGE,
            USERNAME,
        );
        assert_eq!(auth, "S=407A5589115FD0D6209F510FE9C04566932CDA56");
    }
}
