/// 块缓存的可调参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// 缓存槽位个数
    pub capacity: usize,
    /// 访问计数的上限。
    /// 上限越高，驱逐时扫描越久，但越偏袒常用扇区
    pub access_cap: u8,
    /// 定时写回的周期（毫秒）
    pub write_behind_ms: u64,
    /// 是否接受预读请求
    pub read_ahead: bool,
    /// 预读队列为空时的休眠时长（毫秒）
    pub read_ahead_idle_ms: u64,
}

impl CacheConfig {
    pub const CAPACITY: usize = 64;
    pub const ACCESS_CAP: u8 = 3;

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: Self::CAPACITY,
            access_cap: Self::ACCESS_CAP,
            write_behind_ms: 5_000,
            read_ahead: true,
            read_ahead_idle_ms: 10,
        }
    }
}
