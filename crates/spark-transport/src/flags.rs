use std::{fmt, ops};

/// 打开流与单次调用共用的位标志。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 打开类标志：`CONNECT`（0，默认）、`LISTEN`、`MULTICAST`、`NO_SELECT`
///   与 `SELECT`（0，默认）、`TCP_NODELAY`、`NO_REUSEADDR`；
/// - 调用类标志：`DEFAULT`（0）与 `WAIT`，后者启用阻塞包装层；
/// - 零值标志（`CONNECT`、`SELECT`、`DEFAULT`）仅用于提升调用处可读性，
///   [`StreamFlags::contains`] 对它们恒为 `true`。
///
/// ## 注意事项 (Trade-offs)
/// - 两类标志共用一个类型，数值互不重叠，方便在打开时一次性传入并保存在
///   [`crate::StreamHeader`] 中。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const DEFAULT: Self = Self(0);
    pub const CONNECT: Self = Self(0);
    pub const SELECT: Self = Self(0);
    pub const WAIT: Self = Self(0x0001);
    pub const LISTEN: Self = Self(0x0100);
    pub const MULTICAST: Self = Self(0x0400);
    pub const NO_SELECT: Self = Self(0x0800);
    pub const TCP_NODELAY: Self = Self(0x1000);
    pub const NO_REUSEADDR: Self = Self(0x2000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl ops::BitOr for StreamFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl ops::BitOrAssign for StreamFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(StreamFlags, &str); 6] = [
            (StreamFlags::WAIT, "WAIT"),
            (StreamFlags::LISTEN, "LISTEN"),
            (StreamFlags::MULTICAST, "MULTICAST"),
            (StreamFlags::NO_SELECT, "NO_SELECT"),
            (StreamFlags::TCP_NODELAY, "TCP_NODELAY"),
            (StreamFlags::NO_REUSEADDR, "NO_REUSEADDR"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}
