use std::io::Write;

use tempfile::NamedTempFile;

/// Trust material the caller supplies: the device-signing CA and the master root CA, both PEM.
///
/// Resolving these bytes (e.g. from bundled resources or a config store) is outside this
/// crate's scope; it only concatenates them with the device certificate into a chain file the
/// TLS library can consume.
#[derive(Clone)]
pub struct TrustAnchors {
    pub dev_ca_pem: Vec<u8>,
    pub root_ca_pem: Vec<u8>,
}

/// A temporary file holding `device_cert || dev_ca || root_ca`, owned by a single socket.
///
/// Deletion is guaranteed on drop: it's a [`NamedTempFile`], so the OS removes it the moment
/// this value (and therefore the socket that owns it) goes away.
pub struct ChainFile {
    file: NamedTempFile,
}

impl ChainFile {
    pub fn write(device_cert_pem: &[u8], anchors: &TrustAnchors) -> std::io::Result<Self> {
        let mut file = NamedTempFile::new()?;
        file.write_all(device_cert_pem)?;
        file.write_all(&anchors.dev_ca_pem)?;
        file.write_all(&anchors.root_ca_pem)?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_in_order_and_deletes_on_drop() {
        let anchors = TrustAnchors { dev_ca_pem: b"DEV-CA\n".to_vec(), root_ca_pem: b"ROOT-CA\n".to_vec() };
        let chain = ChainFile::write(b"DEVICE-CERT\n", &anchors).unwrap();
        let path = chain.path().to_path_buf();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "DEVICE-CERT\nDEV-CA\nROOT-CA\n");

        drop(chain);
        assert!(!path.exists());
    }
}
