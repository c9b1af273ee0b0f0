use core::fmt::Arguments;

pub static SM_CHECKS: bool = cfg!(feature = "debug");
pub static SM_VERBOSE: bool = cfg!(feature = "verbose");
pub static VERBOSE_DEL: &str = "====================================";

#[cfg(unix)]
mod ext {
    pub fn debug(s: &str, _size: usize) {
        libc_print::libc_println!("{}", s);
    }
}

#[cfg(target_arch = "wasm32")]
mod ext {
    pub fn debug(_s: &str, _size: usize) {
        // No portable debug sink on bare wasm.
    }
}

/// Static out buffer type
type StaticStr = str_buf::StrBuf<200>;
/// Static out buffer - we use it to avoid memory allocations,
/// when something is printed inside allocator code.
static mut OUT_BUFFER: StaticStr = StaticStr::new();
/// Serializes access to the out buffer.
static PRINT_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Prints string with args.
/// What is the out stream defines in @ext module.
#[inline(never)]
pub unsafe fn smprint_fn(args: Arguments<'_>) {
    let lock = PRINT_LOCK.lock();
    core::fmt::write(&mut OUT_BUFFER, args).unwrap();
    ext::debug(&OUT_BUFFER, OUT_BUFFER.len());
    OUT_BUFFER.set_len(0);
    drop(lock);
}

/// Prints string with args if @SM_VERBOSE is set.
/// What is the out stream defines in @ext module.
#[macro_export]
macro_rules! smverbose {
    ($($arg:tt)*) => {
        if $crate::verbose::SM_VERBOSE {
            unsafe { $crate::verbose::smprint_fn(format_args!($($arg)*)) }
        }
    }
}

extern crate alloc;
use self::alloc::alloc::handle_alloc_error;

/// Prints current line and throw error using @handle_alloc_error.
#[inline(never)]
pub unsafe fn smassert_fn(line: u32) {
    smprint_fn(format_args!("ALLOC ASSERT: {}", line));
    handle_alloc_error(self::alloc::alloc::Layout::new::<u32>());
}

/// Acts like assert using handle_alloc_error if @SM_CHECKS is set, else does nothing.
#[macro_export]
macro_rules! smassert {
    ($check:expr) => {
        if $crate::verbose::SM_CHECKS && !($check) {
            unsafe {
                $crate::verbose::smassert_fn(line!());
            };
        }
    };
}
