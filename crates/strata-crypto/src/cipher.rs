use std::fmt;
use std::io::{self, Read, Write};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::KeyInit;
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};
use crate::keystore::{KeySource, Keystore};

/// Plaintext bytes per encrypted chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;
const TAG_SIZE: usize = 16;
const MAGIC: &[u8; 4] = b"STRB";
const FORMAT_VERSION: u8 = 1;
const MODE_SECRET: u8 = 0;
const MODE_PASSWORD: u8 = 1;
const SALT_SIZE: usize = 16;
/// AES-GCM nonce (12 bytes) minus the STREAM counter and last-chunk flag.
const NONCE_PREFIX_SIZE: usize = 7;

#[derive(Clone)]
enum CipherKey {
    Secret([u8; 32]),
    Password { password: String, iterations: u32 },
}

/// Streaming AES-256-GCM encryption for blob content.
///
/// Ciphertext layout:
///
/// ```text
/// "STRB" | version | mode | [salt; 16 if mode = password] | nonce prefix (7)
///        | chunk_0 | chunk_1 | ... | last chunk
/// ```
///
/// Each chunk is [`CHUNK_SIZE`] bytes of plaintext sealed with the STREAM
/// construction (big-endian 32-bit counter), so truncation, reordering and
/// tampering all fail authentication. Password mode derives a fresh key per
/// blob with PBKDF2-HMAC-SHA256 over a random salt.
#[derive(Clone)]
pub struct BlobCipher {
    key: CipherKey,
}

impl BlobCipher {
    /// Cipher over a raw 256-bit key.
    pub fn from_secret(key: [u8; 32]) -> Self {
        Self {
            key: CipherKey::Secret(key),
        }
    }

    /// Cipher that derives per-blob keys from `password`.
    pub fn from_password(password: impl Into<String>, iterations: u32) -> CryptoResult<Self> {
        if iterations == 0 {
            return Err(CryptoError::InvalidKey("PBKDF2 iterations must be positive".into()));
        }
        Ok(Self {
            key: CipherKey::Password {
                password: password.into(),
                iterations,
            },
        })
    }

    /// Resolve a configured key source. A missing keystore or alias is fatal.
    pub fn from_key_source(source: &KeySource) -> CryptoResult<Self> {
        match source {
            KeySource::Keystore { path, alias } => {
                let keystore = Keystore::load(path)?;
                Ok(Self::from_secret(keystore.secret(alias)?))
            }
            KeySource::Password {
                password,
                iterations,
            } => Self::from_password(password.clone(), *iterations),
        }
    }

    fn mode(&self) -> u8 {
        match self.key {
            CipherKey::Secret(_) => MODE_SECRET,
            CipherKey::Password { .. } => MODE_PASSWORD,
        }
    }

    fn aead(&self, salt: &[u8]) -> Aes256Gcm {
        match &self.key {
            CipherKey::Secret(key) => Aes256Gcm::new(GenericArray::from_slice(key)),
            CipherKey::Password {
                password,
                iterations,
            } => {
                let mut key = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, *iterations, &mut key);
                Aes256Gcm::new(GenericArray::from_slice(&key))
            }
        }
    }

    /// Start encrypting into `writer`. The header is written immediately.
    pub fn encrypting_writer<W: Write>(&self, mut writer: W) -> CryptoResult<EncryptingWriter<W>> {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        rng.fill_bytes(&mut nonce_prefix);

        writer.write_all(MAGIC)?;
        writer.write_all(&[FORMAT_VERSION, self.mode()])?;
        if self.mode() == MODE_PASSWORD {
            rng.fill_bytes(&mut salt);
            writer.write_all(&salt)?;
        }
        writer.write_all(&nonce_prefix)?;

        let encryptor =
            EncryptorBE32::from_aead(self.aead(&salt), GenericArray::from_slice(&nonce_prefix));
        Ok(EncryptingWriter {
            inner: writer,
            encryptor: Some(encryptor),
            buffer: Vec::with_capacity(CHUNK_SIZE * 2),
            plaintext_len: 0,
        })
    }

    /// Encrypt everything `reader` yields. Returns the plaintext length.
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, writer: W) -> CryptoResult<u64> {
        let mut encrypting = self.encrypting_writer(writer)?;
        io::copy(&mut reader, &mut encrypting)?;
        let len = encrypting.plaintext_len();
        encrypting.finish()?;
        Ok(len)
    }

    /// Decrypt a stream produced by [`encrypt_stream`](Self::encrypt_stream).
    ///
    /// Plaintext is written chunk by chunk as each one authenticates; on
    /// error the caller must discard whatever was written.
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> CryptoResult<u64> {
        let mut header = [0u8; 6];
        read_header(&mut reader, &mut header)?;
        if &header[..4] != MAGIC {
            return Err(CryptoError::Decryption("not an encrypted blob".into()));
        }
        if header[4] != FORMAT_VERSION {
            return Err(CryptoError::Decryption(format!(
                "unsupported format version {}",
                header[4]
            )));
        }
        if header[5] != self.mode() {
            return Err(CryptoError::Decryption("key mode mismatch".into()));
        }
        let mut salt = [0u8; SALT_SIZE];
        if self.mode() == MODE_PASSWORD {
            read_header(&mut reader, &mut salt)?;
        }
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        read_header(&mut reader, &mut nonce_prefix)?;

        let mut decryptor =
            DecryptorBE32::from_aead(self.aead(&salt), GenericArray::from_slice(&nonce_prefix));

        let sealed_chunk = CHUNK_SIZE + TAG_SIZE;
        let mut buffer = Vec::with_capacity(sealed_chunk * 2);
        let mut read_buf = vec![0u8; sealed_chunk];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            buffer.extend_from_slice(&read_buf[..n]);
            // A full chunk is only "next" once we know more data follows it.
            while buffer.len() > sealed_chunk {
                let plain = decryptor
                    .decrypt_next(&buffer[..sealed_chunk])
                    .map_err(|_| CryptoError::Decryption("authentication failed".into()))?;
                writer.write_all(&plain)?;
                total += plain.len() as u64;
                buffer.drain(..sealed_chunk);
            }
        }
        let plain = decryptor
            .decrypt_last(buffer.as_slice())
            .map_err(|_| CryptoError::Decryption("authentication failed".into()))?;
        writer.write_all(&plain)?;
        writer.flush()?;
        total += plain.len() as u64;
        Ok(total)
    }
}

fn read_header<R: Read>(reader: &mut R, buf: &mut [u8]) -> CryptoResult<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CryptoError::Decryption("truncated header".into())
        } else {
            CryptoError::Io(e)
        }
    })
}

impl fmt::Debug for BlobCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.key {
            CipherKey::Secret(_) => "secret",
            CipherKey::Password { .. } => "password",
        };
        f.debug_struct("BlobCipher").field("mode", &mode).finish()
    }
}

/// A [`Write`] adapter that seals everything written to it.
///
/// Call [`finish`](Self::finish) to seal the final chunk; dropping the
/// writer without finishing leaves an unreadable (truncated) ciphertext.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    encryptor: Option<EncryptorBE32<Aes256Gcm>>,
    buffer: Vec<u8>,
    plaintext_len: u64,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    fn seal_full_chunks(&mut self) -> io::Result<()> {
        while self.buffer.len() > CHUNK_SIZE {
            let encryptor = self
                .encryptor
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already finished"))?;
            let sealed = encryptor
                .encrypt_next(&self.buffer[..CHUNK_SIZE])
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "encryption failed"))?;
            self.inner.write_all(&sealed)?;
            self.buffer.drain(..CHUNK_SIZE);
        }
        Ok(())
    }

    /// Seal the last chunk and hand back the underlying writer.
    pub fn finish(mut self) -> CryptoResult<W> {
        let encryptor = self.encryptor.take().ok_or(CryptoError::Encryption)?;
        let sealed = encryptor
            .encrypt_last(self.buffer.as_slice())
            .map_err(|_| CryptoError::Encryption)?;
        self.inner.write_all(&sealed)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.plaintext_len += buf.len() as u64;
        self.seal_full_chunks()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
