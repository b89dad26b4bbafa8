pub(crate) mod arena;
pub(crate) mod free_list;
pub(crate) mod page;
pub(crate) mod relptr;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
