//! Continuation frames.
//!
//! A suspended unit is represented by a heap frame: a fixed header followed
//! by typed slots. The header's `state` tag selects the resume point; every
//! heap object produced by generated code lives in a slot, so freeing the
//! frame releases everything the unit owns (including nested procedure
//! frames held in handle slots).

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::mem::offset_of;

use super::executable::ExecutionContext;
use crate::target::{List, Target};
use crate::value::{StringPtr, ValueData};

#[repr(C)]
pub(crate) struct FrameHeader {
    pub state: i64,
    pub layout: *const FrameLayout,
    pub ctx: *mut ExecutionContext,
    pub target: *mut Target,
    pub variables: *mut *mut ValueData,
    pub lists: *mut *mut List,
    pub ret: ValueData,
}

pub(crate) const STATE_OFFSET: i32 = offset_of!(FrameHeader, state) as i32;
pub(crate) const CTX_OFFSET: i32 = offset_of!(FrameHeader, ctx) as i32;
pub(crate) const TARGET_OFFSET: i32 = offset_of!(FrameHeader, target) as i32;
pub(crate) const VARIABLES_OFFSET: i32 = offset_of!(FrameHeader, variables) as i32;
pub(crate) const LISTS_OFFSET: i32 = offset_of!(FrameHeader, lists) as i32;
pub(crate) const RET_OFFSET: i32 = offset_of!(FrameHeader, ret) as i32;
pub(crate) const HEADER_SIZE: u32 = (std::mem::size_of::<FrameHeader>() as u32 + 15) & !15;

const FRAME_ALIGN: usize = 16;
const SCALAR_SIZE: u32 = 8;

/// Slot map of one unit's frame. Owned by the compiler context for as long
/// as any frame may point at it.
#[derive(Debug, Clone)]
pub(crate) struct FrameLayout {
    size: u32,
    strings: Vec<u32>,
    values: Vec<u32>,
    handles: Vec<u32>,
}

impl FrameLayout {
    pub fn new() -> Self {
        FrameLayout { size: HEADER_SIZE, strings: Vec::new(), values: Vec::new(), handles: Vec::new() }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Plain 8-byte slot: f64, u8 or a borrowed pointer.
    pub fn scalar(&mut self) -> i32 {
        let offset = self.size;
        self.size += SCALAR_SIZE;
        offset as i32
    }

    /// Owned `*mut StringPtr`, freed on reassignment and teardown.
    pub fn string(&mut self) -> i32 {
        let offset = self.scalar();
        self.strings.push(offset as u32);
        offset
    }

    /// Inline `ValueData`, dropped on teardown.
    pub fn value(&mut self) -> i32 {
        let offset = self.size;
        self.size += ValueData::SIZE;
        self.values.push(offset);
        offset as i32
    }

    /// `count` contiguous value slots; returns the first offset.
    pub fn values(&mut self, count: usize) -> i32 {
        let first = self.size as i32;
        for _ in 0..count {
            self.value();
        }
        first
    }

    /// Frame of a suspended callee.
    pub fn handle(&mut self) -> i32 {
        let offset = self.scalar();
        self.handles.push(offset as u32);
        offset
    }

    fn alloc_layout(&self) -> Layout {
        match Layout::from_size_align(self.size as usize, FRAME_ALIGN) {
            Ok(layout) => layout,
            Err(_) => handle_alloc_error(Layout::new::<FrameHeader>()),
        }
    }

    /// Zeroed frame with its layout pointer filled in. Zero bits are a valid
    /// initial state for every slot kind (null string, Number 0, no callee).
    pub fn alloc(&self) -> *mut u8 {
        let layout = self.alloc_layout();
        // SAFETY: size >= HEADER_SIZE > 0.
        let frame = unsafe { alloc_zeroed(layout) };
        if frame.is_null() {
            handle_alloc_error(layout);
        }
        unsafe { (*(frame as *mut FrameHeader)).layout = self };
        frame
    }

    /// # Safety
    /// `frame` must come from [`FrameLayout::alloc`] and not be used again.
    pub unsafe fn free(frame: *mut u8) {
        unsafe {
            let layout = &*(*(frame as *mut FrameHeader)).layout;
            for &offset in &layout.strings {
                let slot = frame.add(offset as usize) as *mut *mut StringPtr;
                if !(*slot).is_null() {
                    drop(StringPtr::from_raw(*slot));
                }
            }
            for &offset in &layout.values {
                std::ptr::drop_in_place(frame.add(offset as usize) as *mut ValueData);
            }
            for &offset in &layout.handles {
                let slot = frame.add(offset as usize) as *mut *mut u8;
                if !(*slot).is_null() {
                    FrameLayout::free(*slot);
                }
            }
            std::ptr::drop_in_place(&mut (*(frame as *mut FrameHeader)).ret);
            dealloc(frame, layout.alloc_layout());
        }
    }

    /// Re-points a suspended frame and every nested callee frame at the
    /// storage of the run that is about to resume it.
    ///
    /// # Safety
    /// `frame` must be a live frame from [`FrameLayout::alloc`].
    pub unsafe fn refresh(
        frame: *mut u8,
        ctx: *mut ExecutionContext,
        target: *mut Target,
        variables: *mut *mut ValueData,
        lists: *mut *mut List,
    ) {
        unsafe {
            let header = &mut *(frame as *mut FrameHeader);
            header.ctx = ctx;
            header.target = target;
            header.variables = variables;
            header.lists = lists;
            let layout = &*header.layout;
            for &offset in &layout.handles {
                let slot = frame.add(offset as usize) as *mut *mut u8;
                if !(*slot).is_null() {
                    FrameLayout::refresh(*slot, ctx, target, variables, lists);
                }
            }
        }
    }
}
