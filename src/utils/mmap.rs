#[cfg(unix)]
pub mod _unix {
    use std::ptr::null_mut;

    /// Reserved + committed anonymous mapping. Pages are zero on first touch
    /// and can be returned to the OS (and re-zeroed) with `dontneed`.
    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        pub fn new(size: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap of {} bytes failed", size);
                }
                Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                }
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn is_null(&self) -> bool {
            self.start.is_null()
        }

        /// Return an `align`-aligned pointer into the mapping. `align` must be
        /// a power of two no larger than the mapping slack.
        pub fn aligned(&self, align: usize) -> *mut u8 {
            let offset = align - (self.start as usize) % align;
            unsafe { self.start.add(offset % align) }
        }

        /// Give the range back to the OS. Anonymous private pages read as
        /// zero afterwards.
        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
            }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            self.dontneed(page, size);
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    libc::munmap(self.start as *mut _, self.size as _);
                }
            }
        }
    }
}

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        pub fn new(size: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
                if mem.is_null() {
                    panic!("VirtualAlloc of {} bytes failed", size);
                }
                let mem = mem as *mut u8;
                Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                }
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn is_null(&self) -> bool {
            self.start.is_null()
        }

        pub fn aligned(&self, align: usize) -> *mut u8 {
            let offset = align - (self.start as usize) % align;
            unsafe { self.start.add(offset % align) }
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    VirtualFree(self.start.cast(), 0, MEM_RELEASE);
                }
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
