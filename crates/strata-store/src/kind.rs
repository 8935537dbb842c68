/// Structural description of a store stack.
///
/// Used to decide whether two stores can copy between each other without
/// going through a byte-level transfer (same local filesystem, same remote
/// endpoint).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Local,
    Remote {
        endpoint: String,
        bucket: String,
        prefix: String,
    },
    Caching(Box<StoreKind>),
    Transactional(Box<StoreKind>),
    Encrypted(Box<StoreKind>),
}

impl StoreKind {
    /// The bottom of the stack.
    pub fn backend(&self) -> &StoreKind {
        match self {
            Self::Caching(inner) | Self::Transactional(inner) | Self::Encrypted(inner) => {
                inner.backend()
            }
            other => other,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    pub fn is_caching(&self) -> bool {
        match self {
            Self::Caching(_) => true,
            Self::Transactional(inner) | Self::Encrypted(inner) => inner.is_caching(),
            _ => false,
        }
    }

    pub fn is_transactional(&self) -> bool {
        match self {
            Self::Transactional(_) => true,
            Self::Caching(inner) | Self::Encrypted(inner) => inner.is_transactional(),
            _ => false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        match self {
            Self::Encrypted(_) => true,
            Self::Caching(inner) | Self::Transactional(inner) => inner.is_encrypted(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_unwraps_layers() {
        let remote = StoreKind::Remote {
            endpoint: "mem".into(),
            bucket: "b".into(),
            prefix: String::new(),
        };
        let stack = StoreKind::Transactional(Box::new(StoreKind::Caching(Box::new(
            StoreKind::Encrypted(Box::new(remote.clone())),
        ))));
        assert_eq!(stack.backend(), &remote);
        assert!(stack.is_encrypted());
        assert!(stack.is_caching());
        assert!(stack.is_transactional());
        assert!(!remote.is_caching());
        assert!(!StoreKind::Caching(Box::new(StoreKind::Local)).is_encrypted());
        assert!(StoreKind::Local.is_local());
    }
}
