use fxhash::FxHashMap;
use nix::errno::Errno;
use nix::Error;

/// Detail of the last signature error reported on a memory key
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mlx5SigErr {
    pub syndrome: u16,
    /// `trans_sig << 32 | ref_tag`
    pub expected: u64,
    pub actual: u64,
    pub offset: u64,
    pub sig_type: u8,
    pub domain: u8,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Mlx5Sig {
    pub err_exists: bool,
    pub err_count: u64,
    pub err_count_updated: bool,
    pub err_info: Mlx5SigErr,
}

#[derive(Debug, Clone)]
pub struct Mlx5Mkey {
    lkey: u32,
    sig: Option<Mlx5Sig>,
}

impl Mlx5Mkey {
    /// A key created with signature offload carries a signature context
    pub fn new(lkey: u32, with_sig: bool) -> Self {
        Self {
            lkey,
            sig: with_sig.then(Mlx5Sig::default),
        }
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn sig(&self) -> Option<&Mlx5Sig> {
        self.sig.as_ref()
    }

    pub(crate) fn sig_mut(&mut self) -> Option<&mut Mlx5Sig> {
        self.sig.as_mut()
    }

    /// Hand out the pending signature error and clear it
    pub fn check_sig(&mut self) -> Result<Option<Mlx5SigErr>, Error> {
        let sig = self.sig.as_mut().ok_or(Errno::EINVAL)?;
        if !sig.err_exists {
            return Ok(None);
        }
        sig.err_exists = false;
        Ok(Some(sig.err_info))
    }
}

/// Memory keys indexed by `lkey >> 8`
#[derive(Default, Debug)]
pub struct Mlx5MkeyTable {
    table: FxHashMap<u32, Mlx5Mkey>,
}

impl Mlx5MkeyTable {
    pub fn insert(&mut self, mkey: Mlx5Mkey) -> Result<(), Error> {
        let idx = mkey.lkey() >> 8;
        if self.table.contains_key(&idx) {
            return Err(Errno::EEXIST);
        }
        self.table.insert(idx, mkey);
        Ok(())
    }

    pub fn remove(&mut self, lkey: u32) -> Option<Mlx5Mkey> {
        self.table.remove(&(lkey >> 8))
    }

    pub fn find(&self, idx: u32) -> Option<&Mlx5Mkey> {
        self.table.get(&idx)
    }

    pub fn find_mut(&mut self, idx: u32) -> Option<&mut Mlx5Mkey> {
        self.table.get_mut(&idx)
    }

    pub fn count(&self) -> usize {
        self.table.len()
    }
}
