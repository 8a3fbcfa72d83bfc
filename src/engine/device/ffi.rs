//! C declarations of the NPU driver runtime

use std::ffi::c_void;

pub type RawContext = u32;

pub const QUERY_IN_OUT_NUM: u32 = 0;
pub const QUERY_NATIVE_OUTPUT_ATTR: u32 = 9;
pub const QUERY_NATIVE_NHWC_INPUT_ATTR: u32 = 10;

pub const FORMAT_NCHW: u32 = 0;
pub const FORMAT_NHWC: u32 = 1;
pub const FORMAT_NC1HWC2: u32 = 2;

pub const TYPE_FLOAT32: u32 = 0;
pub const TYPE_FLOAT16: u32 = 1;
pub const TYPE_INT8: u32 = 2;
pub const TYPE_UINT8: u32 = 3;

pub const MEM_SYNC_FROM_DEVICE: i32 = 1;

pub const MAX_DIMS: usize = 16;
pub const MAX_NAME_LEN: usize = 256;

#[repr(C)]
pub struct InputOutputNum {
    pub n_input: u32,
    pub n_output: u32,
}

#[repr(C)]
#[derive(Clone)]
pub struct TensorAttr {
    pub index: u32,
    pub n_dims: u32,
    pub dims: [u32; MAX_DIMS],
    pub name: [u8; MAX_NAME_LEN],
    pub n_elems: u32,
    pub size: u32,
    pub fmt: u32,
    pub type_: u32,
    pub qnt_type: u32,
    pub fl: i8,
    pub zp: i32,
    pub scale: f32,
    pub w_stride: u32,
    pub size_with_stride: u32,
    pub pass_through: u8,
    pub h_stride: u32,
}

impl TensorAttr {
    pub fn with_index(index: u32) -> Self {
        // SAFETY: plain-old-data struct, all-zero is a valid value
        let mut attr: Self = unsafe { std::mem::zeroed() };
        attr.index = index;
        attr
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn shape(&self) -> &[u32] {
        &self.dims[..(self.n_dims as usize).min(MAX_DIMS)]
    }
}

#[repr(C)]
pub struct TensorMem {
    pub virt_addr: *mut c_void,
    pub phys_addr: u64,
    pub fd: i32,
    pub offset: i32,
    pub size: u32,
    pub flags: u32,
    pub priv_data: *mut c_void,
}

pub type FnInit = unsafe extern "C" fn(*mut RawContext, *const c_void, u32, u32, *const c_void) -> i32;
pub type FnQuery = unsafe extern "C" fn(RawContext, u32, *mut c_void, u32) -> i32;
pub type FnRun = unsafe extern "C" fn(RawContext, *const c_void) -> i32;
pub type FnDestroy = unsafe extern "C" fn(RawContext) -> i32;
pub type FnCreateMem = unsafe extern "C" fn(RawContext, u32) -> *mut TensorMem;
pub type FnDestroyMem = unsafe extern "C" fn(RawContext, *mut TensorMem) -> i32;
pub type FnSetIoMem = unsafe extern "C" fn(RawContext, *mut TensorMem, *mut TensorAttr) -> i32;
pub type FnMemSync = unsafe extern "C" fn(RawContext, *mut TensorMem, i32) -> i32;
