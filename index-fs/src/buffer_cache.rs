//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定个数的槽位，
//! 把即将操作的扇区复制到槽位中，所有扇区 I/O 都经过这里。
//!
//! 缓存层对使用者来说是透明的：使用者只给出扇区号与扇区内的字节区间，
//! **操作扇区时它一定在槽位当中**。
//!
//! ## 锁
//!
//! - 表锁保护所有槽位的元信息（占用扇区、钉住计数、访问计数），
//!   查找与驱逐都在表锁下完成，但**从不**在表锁下读写设备；
//! - 每个槽位另有一把锁保护其内容，装载、写回都在槽锁下进行。
//!
//! 槽锁之内可以短暂获取表锁，反之则不行。
//!
//! ## 驱逐
//!
//! 二次机会（时钟）算法，见 [`select_victim`]。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use block_dev::BlockDevice;
use spin::Mutex;

use crate::{CacheConfig, FsError, Result, SectorData, SectorId, SECTOR_SIZE};

pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    config: CacheConfig,
    table: Mutex<SlotTable>,
    slots: Box<[Mutex<Slot>]>,
    /// 预读请求，容量与槽位数相同
    read_ahead: Mutex<VecDeque<SectorId>>,
    stopped: AtomicBool,
    counters: Counters,
}

/// 缓存命中情况的快照
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// 被重新分配的已占用槽位数
    pub evictions: u64,
    /// 写回设备的脏扇区数
    pub write_backs: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

struct SlotTable {
    metas: Vec<SlotMeta>,
    /// 时钟指针
    hand: usize,
}

/// 槽位元信息，受表锁保护
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SlotMeta {
    /// 该槽位当前分配给的扇区
    pub sector: Option<SectorId>,
    /// 槽位被重新分配时仍留在其中、尚未写回的旧扇区
    pub draining: Option<SectorId>,
    pub pins: usize,
    pub accesses: u8,
}

/// 槽位内容，受槽锁保护
struct Slot {
    /// 缓冲区里实际装着的扇区，可能落后于 [`SlotMeta::sector`]
    sector: Option<SectorId>,
    dirty: bool,
    data: Box<SectorData>,
}

/// 未命中时如何填充槽位
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fill {
    Device,
    Zero,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, config: CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    sector: None,
                    dirty: false,
                    data: Box::new([0; SECTOR_SIZE]),
                })
            })
            .collect();

        Self {
            device,
            config: CacheConfig {
                capacity,
                ..config
            },
            table: Mutex::new(SlotTable {
                metas: alloc::vec![SlotMeta::default(); capacity],
                hand: 0,
            }),
            slots,
            read_ahead: Mutex::new(VecDeque::with_capacity(capacity)),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// 把扇区内 `offset` 起的 `buf.len()` 个字节读入 `buf`
    pub fn read(&self, sector: SectorId, buf: &mut [u8], offset: usize) -> Result<()> {
        check_range(offset, buf.len())?;
        self.with_sector(sector, |data| {
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
        })
    }

    /// 把 `data` 写到扇区内 `offset` 处，只改动缓存并标脏
    pub fn write(&self, sector: SectorId, data: &[u8], offset: usize) -> Result<()> {
        check_range(offset, data.len())?;
        self.with_sector_mut(sector, |block| {
            block[offset..offset + data.len()].copy_from_slice(data);
        })
    }

    /// 整个扇区清零并标脏，未命中时不读设备
    pub fn zero(&self, sector: SectorId) -> Result<()> {
        self.access(sector, Fill::Zero, |slot| {
            slot.data.fill(0);
            slot.dirty = true;
        })
    }

    #[inline]
    pub fn with_sector<V>(&self, sector: SectorId, f: impl FnOnce(&SectorData) -> V) -> Result<V> {
        self.access(sector, Fill::Device, |slot| f(&slot.data))
    }

    #[inline]
    pub fn with_sector_mut<V>(
        &self,
        sector: SectorId,
        f: impl FnOnce(&mut SectorData) -> V,
    ) -> Result<V> {
        self.access(sector, Fill::Device, |slot| {
            slot.dirty = true;
            f(&mut slot.data)
        })
    }

    /// 同步写回所有脏槽位。
    /// 某个槽位失败不影响其余槽位，返回遇到的第一个错误。
    pub fn flush(&self) -> Result<()> {
        let mut result = Ok(());
        for slot in self.slots.iter() {
            let mut slot = slot.lock();
            if let Err(err) = self.write_back(&mut slot) {
                log::error!("failed to flush sector {:?}: {err}", slot.sector);
                result = result.and(Err(err));
            }
        }
        result
    }

    /// 预读提示，不会阻塞。队列满时丢弃最旧的请求。
    pub fn request_read_ahead(&self, sector: SectorId) {
        if !self.config.read_ahead {
            return;
        }

        let mut queue = self.read_ahead.lock();
        if queue.len() == self.config.capacity {
            queue.pop_front();
        }
        queue.push_back(sector);
    }

    pub fn is_resident(&self, sector: SectorId) -> bool {
        self.table.lock().position(sector).is_some()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 设备总扇区数
    #[inline]
    pub fn sectors(&self) -> usize {
        self.device.num_blocks()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            write_backs: self.counters.write_backs.load(Ordering::Relaxed),
        }
    }

    /// 停止后台任务并写回全部脏扇区
    pub fn shutdown(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        self.read_ahead.lock().clear();
        self.flush()
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn pending_read_ahead(&self) -> Vec<SectorId> {
        self.read_ahead.lock().iter().copied().collect()
    }

    /// 取出一个预读请求并确保其扇区驻留。队列为空时返回空。
    pub(crate) fn serve_read_ahead(&self) -> Option<Result<()>> {
        let sector = self.read_ahead.lock().pop_front()?;
        if self.is_resident(sector) {
            return Some(Ok(()));
        }
        log::trace!("read ahead sector {sector}");
        Some(self.access(sector, Fill::Device, |_| ()))
    }
}

impl BufferCache {
    /// 钉住扇区所在槽位，确保装载后交给 `f`，最后解除钉住
    fn access<V>(&self, sector: SectorId, fill: Fill, f: impl FnOnce(&mut Slot) -> V) -> Result<V> {
        let (index, mut slot) = loop {
            let index = self.pin(sector);
            match self.load(index, sector, fill) {
                Ok(Some(slot)) => break (index, slot),
                // 等槽锁期间槽位已被收回，重新查找
                Ok(None) => self.unpin(index),
                Err(err) => {
                    self.unpin(index);
                    return Err(err);
                }
            }
        };

        let value = f(&mut slot);
        drop(slot);
        self.unpin(index);
        Ok(value)
    }

    #[inline]
    fn unpin(&self, index: usize) {
        self.table.lock().metas[index].pins -= 1;
    }

    /// 在表中为扇区找到（或腾出）槽位并钉住，返回槽位下标。
    /// 这是缓存唯一会等待的地方：旧内容正在写回，或所有槽位都被钉住。
    fn pin(&self, sector: SectorId) -> usize {
        loop {
            let mut table = self.table.lock();

            if table.is_draining(sector) {
                drop(table);
                hint::spin_loop();
                continue;
            }

            if let Some(index) = table.position(sector) {
                let meta = &mut table.metas[index];
                meta.pins += 1;
                meta.accesses = meta.accesses.saturating_add(1).min(self.config.access_cap);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return index;
            }

            let SlotTable { metas, hand } = &mut *table;
            if let Some(index) = select_victim(metas, hand) {
                let meta = &mut metas[index];
                meta.draining = meta.sector.replace(sector);
                meta.pins = 1;
                meta.accesses = 0;
                if meta.draining.is_some() {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return index;
            }

            drop(table);
            hint::spin_loop();
        }
    }

    /// 锁住槽位；若其中不是目标扇区，先写回旧内容再填充。
    ///
    /// 旧内容写回失败时，槽位连同脏数据还给旧扇区；
    /// 读设备失败时，槽位不再分配给任何扇区。
    /// 两种情况下等在槽锁上的其他请求都会得到空，须重新查找。
    fn load(
        &self,
        index: usize,
        sector: SectorId,
        fill: Fill,
    ) -> Result<Option<spin::MutexGuard<'_, Slot>>> {
        let mut slot = self.slots[index].lock();
        if slot.sector == Some(sector) {
            return Ok(Some(slot));
        }
        if self.table.lock().metas[index].sector != Some(sector) {
            return Ok(None);
        }

        if let Err(err) = self.write_back(&mut slot) {
            let mut table = self.table.lock();
            let meta = &mut table.metas[index];
            meta.sector = meta.draining.take();
            log::error!(
                "failed to write back sector {:?} for {sector}, kept in slot {index}: {err}",
                meta.sector
            );
            return Err(err);
        }
        slot.sector = None;
        self.table.lock().metas[index].draining = None;

        let filled = match fill {
            Fill::Device => self
                .device
                .read_block(sector.into(), &mut slot.data[..])
                .map_err(FsError::from),
            Fill::Zero => {
                slot.data.fill(0);
                Ok(())
            }
        };
        if let Err(err) = filled {
            self.table.lock().metas[index].sector = None;
            return Err(err);
        }
        slot.sector = Some(sector);
        log::trace!("sector {sector} loaded into slot {index}");

        Ok(Some(slot))
    }

    fn write_back(&self, slot: &mut Slot) -> Result<()> {
        if let (Some(sector), true) = (slot.sector, slot.dirty) {
            self.device.write_block(sector.into(), &slot.data[..])?;
            slot.dirty = false;
            self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl SlotTable {
    #[inline]
    fn position(&self, sector: SectorId) -> Option<usize> {
        self.metas
            .iter()
            .position(|meta| meta.sector == Some(sector))
    }

    #[inline]
    fn is_draining(&self, sector: SectorId) -> bool {
        self.metas
            .iter()
            .any(|meta| meta.draining == Some(sector))
    }
}

/// 二次机会算法：从时钟指针处轮转扫描，
/// 跳过被钉住的槽位；访问计数为正的槽位计数减一后跳过；
/// 第一个既未钉住、计数又为零的槽位即为牺牲者。
///
/// 所有槽位都被钉住时返回空。
pub(crate) fn select_victim(metas: &mut [SlotMeta], hand: &mut usize) -> Option<usize> {
    if metas.iter().all(|meta| meta.pins > 0) {
        return None;
    }

    loop {
        let index = *hand;
        *hand = (*hand + 1) % metas.len();

        let meta = &mut metas[index];
        if meta.pins > 0 {
            continue;
        }
        if meta.accesses > 0 {
            meta.accesses -= 1;
            continue;
        }
        return Some(index);
    }
}

#[inline]
fn check_range(offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= SECTOR_SIZE => Ok(()),
        _ => Err(FsError::SectorOverrun { offset, len }),
    }
}

#[cfg(test)]
mod tests {
    use block_dev::DeviceError;

    use super::*;
    use crate::test_util::RamDisk;

    fn meta(sector: u32, pins: usize, accesses: u8) -> SlotMeta {
        SlotMeta {
            sector: Some(SectorId::new(sector)),
            draining: None,
            pins,
            accesses,
        }
    }

    #[test]
    fn victim_skips_pinned_and_spends_second_chances() {
        let mut metas = [meta(10, 1, 0), meta(11, 0, 2), meta(12, 0, 1)];
        let mut hand = 0;

        // 第一轮：10 被钉住，11、12 各耗掉一次机会；
        // 第二轮：12 先归零
        assert_eq!(select_victim(&mut metas, &mut hand), Some(2));
        assert_eq!(metas[1].accesses, 0);
        assert_eq!(metas[2].accesses, 0);
        assert_eq!(hand, 0);
    }

    #[test]
    fn victim_never_pinned() {
        let mut metas = [meta(1, 2, 0), meta(2, 1, 0)];
        let mut hand = 1;
        assert_eq!(select_victim(&mut metas, &mut hand), None);

        metas[0].pins = 0;
        assert_eq!(select_victim(&mut metas, &mut hand), Some(0));
    }

    #[test]
    fn range_must_stay_in_one_sector() {
        let cache = BufferCache::new(Arc::new(RamDisk::new(8)), CacheConfig::with_capacity(2));
        let mut buf = [0; 8];
        assert_eq!(
            cache.read(SectorId::new(1), &mut buf, SECTOR_SIZE - 4),
            Err(FsError::SectorOverrun {
                offset: SECTOR_SIZE - 4,
                len: 8
            })
        );
        assert!(cache.write(SectorId::new(1), &buf, SECTOR_SIZE - 8).is_ok());
    }

    #[test]
    fn zero_skips_device_read() {
        let disk = Arc::new(RamDisk::new(8));
        let cache = BufferCache::new(disk.clone(), CacheConfig::with_capacity(2));

        cache.zero(SectorId::new(3)).unwrap();
        assert_eq!(disk.reads(), 0);

        let mut buf = [0xff; 4];
        cache.read(SectorId::new(3), &mut buf, 100).unwrap();
        assert_eq!(buf, [0; 4]);
        assert_eq!(disk.reads(), 0);
    }

    #[test]
    fn dirty_data_survives_eviction() {
        let disk = Arc::new(RamDisk::new(16));
        let cache = BufferCache::new(disk.clone(), CacheConfig::with_capacity(2));

        for i in 0..6u32 {
            cache
                .write(SectorId::new(i), &[i as u8 + 1; 16], 0)
                .unwrap();
        }
        assert!(!cache.is_resident(SectorId::new(0)));
        assert!(cache.stats().evictions > 0);

        for i in 0..6u32 {
            let mut buf = [0; 16];
            cache.read(SectorId::new(i), &mut buf, 0).unwrap();
            assert_eq!(buf, [i as u8 + 1; 16]);
        }
    }

    #[test]
    fn failed_read_frees_the_slot() {
        let cache = BufferCache::new(Arc::new(RamDisk::new(8)), CacheConfig::with_capacity(2));
        let beyond = SectorId::new(100);
        let mut buf = [0; 4];

        for _ in 0..2 {
            assert_eq!(
                cache.read(beyond, &mut buf, 0),
                Err(FsError::Device(DeviceError::OutOfRange(100)))
            );
            assert!(!cache.is_resident(beyond));
        }
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 2);

        cache.read(SectorId::new(1), &mut buf, 0).unwrap();
        assert!(cache.is_resident(SectorId::new(1)));
    }

    #[test]
    fn pinned_sector_stays_resident() {
        let disk = Arc::new(RamDisk::new(16));
        let cache = BufferCache::new(disk, CacheConfig::with_capacity(2));
        let pinned = SectorId::new(7);

        cache
            .with_sector_mut(pinned, |data| {
                data[0] = 42;
                for i in 8..14u32 {
                    cache.write(SectorId::new(i), &[1], 0).unwrap();
                    assert!(cache.is_resident(pinned));
                }
            })
            .unwrap();

        let mut buf = [0; 1];
        cache.read(pinned, &mut buf, 0).unwrap();
        assert_eq!(buf, [42]);
    }

    #[test]
    fn read_ahead_queue_is_bounded() {
        let cache = BufferCache::new(Arc::new(RamDisk::new(16)), CacheConfig::with_capacity(3));
        for i in 1..=5u32 {
            cache.request_read_ahead(SectorId::new(i));
        }
        assert_eq!(
            cache.pending_read_ahead(),
            [3, 4, 5].map(SectorId::new).to_vec()
        );

        assert_eq!(cache.serve_read_ahead(), Some(Ok(())));
        assert!(cache.is_resident(SectorId::new(3)));
    }

    #[test]
    fn flush_writes_dirty_slots() {
        let disk = Arc::new(RamDisk::new(8));
        let cache = BufferCache::new(disk.clone(), CacheConfig::with_capacity(4));

        cache.write(SectorId::new(5), b"index", 10).unwrap();
        assert_eq!(&disk.sector(5)[10..15], [0; 5]);

        cache.flush().unwrap();
        assert_eq!(&disk.sector(5)[10..15], b"index");
        assert_eq!(cache.stats().write_backs, 1);

        // 已写回的槽位不再重复写
        cache.flush().unwrap();
        assert_eq!(cache.stats().write_backs, 1);
    }
}
