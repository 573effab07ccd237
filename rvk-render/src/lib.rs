//! A real-time Vulkan rendering core built on [`ash`].
//!
//! The crate owns the GPU device, the presentable surface, per-frame
//! synchronisation and the lifetime of GPU-resident resources. Window
//! event pumping, shader compilation and asset parsing are left to the
//! caller; they feed in a display/window handle, SPIR-V words, and flat
//! mesh and pixel arrays.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! │   └── PresentationChain<T>
//! └── Device
//!     ├── ResourceAllocator ─┬─ GpuBuffer
//!     │                      └─ GpuImage / Sampler
//!     ├── Renderable → Scene (descriptor sets per frame slot)
//!     ├── ShaderModule → EntryPoint → GraphicsPipeline
//!     └── FrameSlots (command buffer, semaphores, fence, uniforms)
//!         └── driven by FramePacer
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod image;
pub mod instance;
pub mod log;
pub mod pipeline;
pub mod renderable;
pub mod resource;
pub mod sampler;
pub mod scene;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;
