use crate::error::VmError;
use crate::types::TypeId;

/// Runtime version an object file was built for, packed one byte per
/// component with `preview` lowest.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub preview: u8,
}

impl Version {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Version {
            major,
            minor,
            patch,
            preview: 0,
        }
    }

    pub fn as_u64(self) -> u64 {
        (self.major as u64) << 24 | (self.minor as u64) << 16 | (self.patch as u64) << 8 | self.preview as u64
    }

    pub fn from_u64(n: u64) -> Self {
        Version {
            major: (n >> 24) as u8,
            minor: (n >> 16) as u8,
            patch: (n >> 8) as u8,
            preview: n as u8,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub id: u32,
    pub name: String,
    /// Number of global slots the module needs.
    pub globals: usize,
}

#[derive(Clone, Debug)]
pub struct FnInfo {
    pub name: String,
    pub module: u32,
    /// Offset of the first instruction within the module.
    pub offset: u32,
    /// Local slots reserved on entry.
    pub frame_size: u32,
    pub ty: TypeId,
}

/// Everything a VM needs to know about the code it runs, minus the code.
#[derive(Clone, Debug, Default)]
pub struct ObjectFile {
    pub version: Version,
    pub modules: Vec<ModuleInfo>,
    pub functions: Vec<FnInfo>,
    /// Module execution starts in.
    pub entry: u32,
}

impl ObjectFile {
    pub fn new(version: Version) -> Self {
        ObjectFile {
            version,
            ..Default::default()
        }
    }

    pub fn add_module(&mut self, name: &str, globals: usize) -> u32 {
        let id = self.modules.len() as u32;

        self.modules.push(ModuleInfo {
            id,
            name: name.to_string(),
            globals,
        });
        id
    }

    pub fn add_function(&mut self, info: FnInfo) -> usize {
        self.functions.push(info);
        self.functions.len() - 1
    }

    pub fn module(&self, id: u32) -> Result<&ModuleInfo, VmError> {
        self.modules.get(id as usize).ok_or(VmError::UnknownModule(id))
    }

    pub fn function(&self, ix: usize) -> Result<&FnInfo, VmError> {
        self.functions.get(ix).ok_or(VmError::UnknownFunction(ix))
    }

    pub fn find_function(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }
}
