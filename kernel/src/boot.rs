/// Pixel layout of the frame buffer, as reported by the loader.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Bgr,
}

/// This struct has information about FrameBuffer.
/// - fb: the base address of framebuffer
/// - stride: pixels per scan line
/// - resolution: horizontal and vertical resolution
/// - format: pixel format
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameBufferConfig {
    pub fb: *mut u8,
    pub stride: usize,
    pub resolution: (usize, usize),
    pub format: PixelFormat,
}

/// Everything the loader hands over at entry.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct BootInfo {
    pub frame_buffer: FrameBufferConfig,
    pub memory_map: *const u8,
    pub memory_map_size: usize,
    pub descriptor_size: usize,
}
